pub mod builds;
pub mod health;
pub mod pipelines;
pub mod pipes;
pub mod workers;

use axum::http::StatusCode;
use crucible_core::Error;

/// Maps core errors onto HTTP status codes.
pub(crate) fn error_response(err: Error) -> (StatusCode, String) {
    let status = match &err {
        Error::NoBuild | Error::PipelineNotFound(_) | Error::ContainerNotFound => {
            StatusCode::NOT_FOUND
        }
        Error::ConfigComparisonFailed => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

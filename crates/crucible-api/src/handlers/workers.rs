//! Worker registration handlers.

use crate::handlers::error_response;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use crucible_core::workers::WorkerInfo;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize)]
pub struct RegisterParams {
    pub ttl: Option<String>,
}

pub async fn list_workers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<WorkerInfo>>, (StatusCode, String)> {
    let workers = state.workers.workers().await.map_err(error_response)?;
    Ok(Json(workers))
}

/// Registers (or re-registers) a worker. A missing or zero TTL pins the
/// registration indefinitely.
pub async fn register_worker(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RegisterParams>,
    Json(registration): Json<WorkerInfo>,
) -> Result<StatusCode, (StatusCode, String)> {
    if registration.addr.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "missing address".to_string()));
    }

    let ttl = match params.ttl.as_deref() {
        Some(raw) => parse_duration(raw)
            .ok_or((StatusCode::BAD_REQUEST, "malformed ttl".to_string()))?,
        None => Duration::ZERO,
    };

    state
        .workers
        .save_worker(&registration, ttl)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::OK)
}

/// Parses durations of the form `30s`, `5m`, `1h`, or bare seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.strip_suffix(['s', 'm', 'h']) {
        Some(digits) => {
            let multiplier = match raw.chars().last()? {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                _ => return None,
            };
            (digits, multiplier)
        }
        None => (raw, 1),
    };

    let value: u64 = digits.parse().ok()?;
    Some(Duration::from_secs(value * multiplier))
}

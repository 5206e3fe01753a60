//! Pipeline and resource handlers.

use crate::handlers::error_response;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use crucible_core::config::PipelineConfig;
use crucible_core::ids::ConfigVersion;
use serde::Serialize;
use std::sync::Arc;

const CONFIG_VERSION_HEADER: &str = "x-config-version";

#[derive(Serialize)]
pub struct PipelineResponse {
    pub name: String,
    pub version: ConfigVersion,
    pub paused: bool,
}

pub async fn list_pipelines(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PipelineResponse>>, (StatusCode, String)> {
    let pipelines = state
        .configs
        .get_pipelines()
        .await
        .map_err(error_response)?;

    Ok(Json(
        pipelines
            .into_iter()
            .map(|p| PipelineResponse {
                name: p.name,
                version: p.version,
                paused: p.paused,
            })
            .collect(),
    ))
}

pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<(HeaderMap, Json<PipelineConfig>), (StatusCode, String)> {
    let (config, version) = state
        .configs
        .get_config(&name)
        .await
        .map_err(error_response)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONFIG_VERSION_HEADER,
        version.to_string().parse().expect("version is ascii"),
    );
    Ok((headers, Json(config)))
}

pub async fn save_config(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(config): Json<PipelineConfig>,
) -> Result<(StatusCode, String), (StatusCode, String)> {
    // Version zero means "create"; anything else is compare-and-swap
    // against the caller's last-seen version.
    let expected: ConfigVersion = match headers.get(CONFIG_VERSION_HEADER) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or((StatusCode::BAD_REQUEST, "malformed config version".to_string()))?,
        None => 0,
    };

    let version = state
        .configs
        .save_config(&name, &config, expected, None)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::OK, version.to_string()))
}

pub async fn pause_pipeline(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .configs
        .set_pipeline_paused(&name, true)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::OK)
}

pub async fn unpause_pipeline(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .configs
        .set_pipeline_paused(&name, false)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
pub struct ResourceResponse {
    pub name: String,
    pub paused: bool,
    pub failing_to_check: bool,
    pub check_error: Option<String>,
}

pub async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path((_pipeline, resource)): Path<(String, String)>,
) -> Result<Json<ResourceResponse>, (StatusCode, String)> {
    let saved = state
        .versions
        .get_resource(&resource)
        .await
        .map_err(error_response)?;

    Ok(Json(ResourceResponse {
        name: saved.name.clone(),
        paused: saved.paused,
        failing_to_check: saved.failing_to_check(),
        check_error: saved.check_error,
    }))
}

pub async fn pause_resource(
    State(state): State<Arc<AppState>>,
    Path((_pipeline, resource)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .versions
        .set_resource_paused(&resource, true)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::OK)
}

pub async fn unpause_resource(
    State(state): State<Arc<AppState>>,
    Path((_pipeline, resource)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .versions
        .set_resource_paused(&resource, false)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::OK)
}

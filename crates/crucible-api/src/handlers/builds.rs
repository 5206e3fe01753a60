//! Build handlers, including the event stream.

use crate::handlers::error_response;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use crucible_core::builds::Build;
use crucible_core::ids::BuildId;
use crucible_core::plan::Plan;
use crucible_core::ports::BuildEventSource;
use crucible_core::Error;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::warn;

#[derive(Serialize)]
pub struct BuildResponse {
    pub id: i64,
    pub name: String,
    pub job_name: Option<String>,
    pub status: String,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl From<&Build> for BuildResponse {
    fn from(build: &Build) -> Self {
        Self {
            id: build.id.raw(),
            name: build.name.clone(),
            job_name: build.job_name.clone(),
            status: build.status.to_string(),
            start_time: build.start_time.map(|t| t.timestamp()),
            end_time: build.end_time.map(|t| t.timestamp()),
        }
    }
}

pub async fn list_builds(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BuildResponse>>, (StatusCode, String)> {
    let builds = state.builds.get_all_builds().await.map_err(error_response)?;
    Ok(Json(builds.iter().map(BuildResponse::from).collect()))
}

pub async fn get_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<BuildResponse>, (StatusCode, String)> {
    let build = state
        .builds
        .get_build(BuildId::new(id))
        .await
        .map_err(error_response)?;
    Ok(Json(BuildResponse::from(&build)))
}

/// Creates a one-off build from a submitted plan and runs it immediately.
pub async fn create_one_off(
    State(state): State<Arc<AppState>>,
    Json(plan): Json<Plan>,
) -> Result<(StatusCode, Json<BuildResponse>), (StatusCode, String)> {
    let build = state
        .builds
        .create_one_off_build()
        .await
        .map_err(error_response)?;

    state
        .builds
        .schedule_build(build.id, false)
        .await
        .map_err(error_response)?;

    let running = state
        .engine
        .create_build(&build, &plan)
        .await
        .map_err(error_response)?;
    let metadata = running.metadata().map_err(error_response)?;

    let started = state
        .builds
        .start_build(build.id, state.engine.name(), &metadata)
        .await
        .map_err(error_response)?;

    if started {
        tokio::spawn(async move { running.resume().await });
    }

    Ok((StatusCode::CREATED, Json(BuildResponse::from(&build))))
}

pub async fn abort_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .builds
        .abort_build(BuildId::new(id))
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct EventsParams {
    #[serde(default)]
    pub from: u32,
}

/// Streams the build's events in sequence order from the requested offset,
/// ending with an `end` marker once the build is terminal.
pub async fn build_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<EventsParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let source = state
        .builds
        .get_build_events(BuildId::new(id), params.from)
        .await
        .map_err(error_response)?;

    let stream = futures::stream::unfold(Some(source), move |source| async move {
        let mut source: Box<dyn BuildEventSource> = source?;
        match source.next().await {
            Ok(event) => {
                let data = match serde_json::to_string(&event) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(error = %err, "failed to serialize build event");
                        return None;
                    }
                };
                Some((Ok(Event::default().event("event").data(data)), Some(source)))
            }
            Err(Error::EndOfStream) => Some((Ok(Event::default().event("end").data("")), None)),
            Err(_) => None,
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

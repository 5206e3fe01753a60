//! Pipe handlers: one-shot byte streams between nodes.

use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

#[derive(Serialize)]
pub struct PipeResponse {
    pub id: Uuid,
}

pub async fn create_pipe(State(state): State<Arc<AppState>>) -> (StatusCode, Json<PipeResponse>) {
    let id = state.pipes.create();
    (StatusCode::CREATED, Json(PipeResponse { id }))
}

pub async fn read_pipe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Body, (StatusCode, String)> {
    let reader = state
        .pipes
        .claim_reader(id)
        .ok_or((StatusCode::NOT_FOUND, "no such pipe".to_string()))?;

    let stream = ReceiverStream::new(reader).map(Ok::<_, std::io::Error>);
    Ok(Body::from_stream(stream))
}

pub async fn write_pipe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: axum::body::Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let writer = state
        .pipes
        .claim_writer(id)
        .ok_or((StatusCode::NOT_FOUND, "no such pipe".to_string()))?;

    if writer.send(body).await.is_err() {
        return Err((StatusCode::GONE, "reader disconnected".to_string()));
    }

    Ok(StatusCode::OK)
}

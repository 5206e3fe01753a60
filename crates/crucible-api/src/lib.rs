//! HTTP surface for the control plane.
//!
//! Deliberately thin: request parsing and status codes live here, the
//! behaviour lives behind the store and engine ports. Private endpoints sit
//! behind HTTP Basic auth; health does not.

mod auth;
mod handlers;
mod pipes;
mod state;

pub use auth::BasicAuth;
pub use pipes::Pipes;
pub use state::AppState;

use axum::routing::{get, post, put};
use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn build_app(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/pipelines", get(handlers::pipelines::list_pipelines))
        .route(
            "/pipelines/{name}/config",
            get(handlers::pipelines::get_config).put(handlers::pipelines::save_config),
        )
        .route(
            "/pipelines/{name}/pause",
            put(handlers::pipelines::pause_pipeline),
        )
        .route(
            "/pipelines/{name}/unpause",
            put(handlers::pipelines::unpause_pipeline),
        )
        .route(
            "/pipelines/{name}/resources/{resource}",
            get(handlers::pipelines::get_resource),
        )
        .route(
            "/pipelines/{name}/resources/{resource}/pause",
            put(handlers::pipelines::pause_resource),
        )
        .route(
            "/pipelines/{name}/resources/{resource}/unpause",
            put(handlers::pipelines::unpause_resource),
        )
        .route(
            "/builds",
            get(handlers::builds::list_builds).post(handlers::builds::create_one_off),
        )
        .route("/builds/{id}", get(handlers::builds::get_build))
        .route("/builds/{id}/abort", post(handlers::builds::abort_build))
        .route("/builds/{id}/events", get(handlers::builds::build_events))
        .route(
            "/workers",
            get(handlers::workers::list_workers).post(handlers::workers::register_worker),
        )
        .route("/pipes", post(handlers::pipes::create_pipe))
        .route(
            "/pipes/{id}",
            get(handlers::pipes::read_pipe).put(handlers::pipes::write_pipe),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(handlers::health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

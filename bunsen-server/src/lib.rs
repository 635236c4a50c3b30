pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod github;
pub mod reconciliation;
pub mod recording;
pub mod responder;
pub mod status;
pub mod store;
pub mod webhook;

use std::sync::Arc;

use axum::{http::StatusCode, response::Json, routing::get, Router};
use bunsen_core::EventVerifier;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use coordinator::{Coordinator, CoordinatorError, Outcome, Stage};
pub use recording::RecordingLogger;
pub use store::ThreadStore;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(8).collect()
}

pub fn get_version() -> String {
    // Nix builds pass the hash in; cargo builds ask git.
    if let Some(git_hash) = option_env!("BUNSEN_GIT_HASH") {
        short_hash(git_hash)
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        short_hash(git_hash)
    } else {
        "unknown".to_string()
    }
}

pub struct AppState {
    pub verifier: EventVerifier,
    pub coordinator: Coordinator,
    pub store: ThreadStore,
    pub status_auth_token: Option<String>,
    pub recording_logger: Option<RecordingLogger>,
}

async fn root_handler() -> &'static str {
    "bunsen is running\n"
}

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "bunsen",
        "version": get_version(),
    })))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/status", get(status::status_handler))
        .merge(webhook::webhook_router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

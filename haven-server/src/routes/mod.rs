pub mod agents;
pub mod devices;
pub mod jobs;
pub mod tasks;

use crate::state::AppState;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .nest("/api/devices", devices::router(state.clone()))
        .nest("/api/agents", agents::router())
        .nest("/api/agent-tasks", tasks::router())
        .nest("/api/jobs", jobs::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

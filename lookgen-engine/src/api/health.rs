//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;

use crate::AppState;

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// GET /health - liveness plus basic engine stats
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime_seconds = (chrono::Utc::now() - state.startup_time).num_seconds();
    let active_batches = state.active_batches.read().await.len();

    Json(json!({
        "status": "ok",
        "service": "lookgen-engine",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime_seconds,
        "active_batches": active_batches,
    }))
}

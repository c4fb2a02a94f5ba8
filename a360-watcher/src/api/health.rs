//! Health check endpoint

use crate::AppState;
use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};

/// GET /health - service liveness and uptime
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = (Utc::now() - state.startup_time).num_seconds();
    Json(json!({
        "status": "ok",
        "service": "a360-watcher",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": uptime,
        "observers": state.event_bus.subscriber_count(),
    }))
}

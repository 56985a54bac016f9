//! Liveness check with a glance at the dispatch queue.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::warn;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// 200 with the queue summary while the task table answers, 503 otherwise.
pub async fn get_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match state.studio.get_queue_status().await {
        Ok(queue) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "queue": {
                    "waiting": queue.queue_size,
                    "active": queue.active,
                    "max_concurrent": queue.max_concurrent,
                    "dispatching": queue.is_processing,
                },
            })),
        ),
        Err(err) => {
            warn!(error = %err, "health check could not read the task table");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "version": env!("CARGO_PKG_VERSION") })),
            )
        }
    }
}

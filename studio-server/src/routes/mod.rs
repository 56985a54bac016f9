//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - Health / heartbeat route
//! - Caller-facing `/v1` routes
//! - admin `/admin` routes (optionally protected by bearer token)
//! - generated artifacts under `/storage`

mod admin;
mod health;
mod tasks;

use std::sync::Arc;

use axum::routing::get_service;
use axum::{Router, middleware};
use tower::ServiceBuilder;
use tower_http::services::ServeDir;

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .nest("/v1", tasks::router())
        .nest("/admin", admin::router(Arc::clone(&state)))
        .nest_service("/storage", get_service(ServeDir::new(&state.config.storage_dir)))
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(&state.config)))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}

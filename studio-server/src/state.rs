//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use studio_core::Studio;

use crate::config::Config;

/// State shared across all HTTP handlers and the maintenance loops.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// The orchestration core.
    pub studio: Arc<Studio>,
}

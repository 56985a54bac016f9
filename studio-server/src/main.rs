//! studio-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables (and the optional TOML
//!    file named by `STUDIO_CONFIG`).
//! 2. Initialise structured tracing (JSON when `STUDIO_LOG_JSON=1`).
//! 3. Prepare the artifact directories and build the orchestration core.
//! 4. Spawn the maintenance loops.
//! 5. Build the Axum router and start the HTTP server with graceful shutdown.

mod config;
mod error;
mod extract;
mod maintenance;
mod middleware;
mod routes;
mod services;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use studio_core::Studio;
use tracing::{info, warn};

use crate::config::Config;
use crate::services::{LocalArtifactStore, SimulatedExecutor};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: STUDIO_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "studio-server starting");

    // ── 3. Orchestration core ──────────────────────────────────────────────────
    let studio_config = cfg.studio_config()?;
    let artifacts = Arc::new(LocalArtifactStore::new(&cfg.storage_dir));
    artifacts.prepare().await?;
    info!(storage_dir = %artifacts.root().display(), "artifact storage ready");

    let executor = SimulatedExecutor::new(artifacts.clone(), Duration::from_millis(cfg.sim_step_ms));
    let studio = Arc::new(
        Studio::builder(Arc::new(executor))
            .config(studio_config)
            .artifacts(artifacts)
            .build(),
    );

    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        studio: Arc::clone(&studio),
    });

    // ── 4. Maintenance ─────────────────────────────────────────────────────────
    let maintenance = maintenance::spawn(Arc::clone(&studio));

    // ── 5. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in maintenance {
        handle.abort();
    }
    studio.shutdown();

    info!("studio-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}

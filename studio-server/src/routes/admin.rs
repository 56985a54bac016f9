//! `/admin` endpoints: user and quota administration, security insight and
//! maintenance triggers. Guarded by the bearer-token middleware.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router, middleware};
use serde::Deserialize;
use serde_json::{Value, json};
use studio_core::{QuotaLimit, QuotaSnapshot, Role, SecurityEvent, SecurityStats};
use tracing::info;

use crate::error::ServerError;
use crate::middleware::auth;
use crate::state::AppState;

const DEFAULT_EVENT_LIMIT: usize = 100;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/users", post(register_user))
        .route("/users/{id}/quota", get(user_quota))
        .route("/users/{id}/limits", put(set_limit))
        .route("/users/{id}/block", delete(unblock_user))
        .route("/security/stats", get(security_stats))
        .route("/security/events", get(security_events))
        .route("/ips/{ip}/block", post(block_ip).delete(unblock_ip))
        .route("/maintenance/sweep", post(run_sweep))
        .route_layer(middleware::from_fn_with_state(state, auth::admin_auth))
}

#[derive(Debug, Deserialize)]
pub struct RegisterUserBody {
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::Standard
}

#[derive(Debug, Deserialize)]
pub struct SetLimitBody {
    pub resource: String,
    /// `-1` for unlimited.
    pub limit: QuotaLimit,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// Register a user, or change the role of an existing one.
pub async fn register_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterUserBody>,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    let user_id = body.user_id.trim();
    if user_id.is_empty() {
        return Err(ServerError::BadRequest("user_id must not be empty".into()));
    }
    let status = if state.studio.register_user(user_id, body.role) {
        info!(user_id, role = %body.role, "user registered");
        StatusCode::CREATED
    } else {
        state.studio.set_role(user_id, body.role)?;
        info!(user_id, role = %body.role, "user role updated");
        StatusCode::OK
    };
    Ok((status, Json(json!({ "user_id": user_id, "role": body.role }))))
}

pub async fn user_quota(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<QuotaSnapshot>, ServerError> {
    Ok(Json(state.studio.quota(&id)?))
}

pub async fn set_limit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SetLimitBody>,
) -> Result<Json<QuotaSnapshot>, ServerError> {
    state.studio.set_limit(&id, &body.resource, body.limit)?;
    info!(user_id = %id, resource = %body.resource, limit = ?body.limit, "quota limit overridden");
    Ok(Json(state.studio.quota(&id)?))
}

pub async fn security_stats(State(state): State<Arc<AppState>>) -> Json<SecurityStats> {
    Json(state.studio.security_stats())
}

pub async fn security_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<EventsQuery>,
) -> Json<Vec<SecurityEvent>> {
    Json(state.studio.security_events(q.limit.unwrap_or(DEFAULT_EVENT_LIMIT)))
}

pub async fn block_ip(State(state): State<Arc<AppState>>, Path(ip): Path<String>) -> Json<Value> {
    state.studio.block_ip(&ip);
    info!(%ip, "ip blocked by admin");
    Json(json!({ "ip": ip, "blocked": true }))
}

pub async fn unblock_ip(State(state): State<Arc<AppState>>, Path(ip): Path<String>) -> Json<Value> {
    let removed = state.studio.unblock_ip(&ip);
    info!(%ip, removed, "ip unblocked by admin");
    Json(json!({ "ip": ip, "blocked": false, "was_blocked": removed }))
}

/// Lift a rate-limit block on a user. IP blocks are lifted separately.
pub async fn unblock_user(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Json<Value> {
    let removed = state.studio.unblock_user(&id);
    info!(user_id = %id, removed, "user unblocked by admin");
    Json(json!({ "user_id": id, "blocked": false, "was_blocked": removed }))
}

pub async fn run_sweep(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ServerError> {
    let report = state.studio.cleanup_expired_tasks().await?;
    let pruned = state.studio.sweep_security();
    Ok(Json(json!({
        "removed_tasks": report.removed_tasks,
        "removed_artifacts": report.removed_artifacts,
        "pruned_security_entries": pruned,
    })))
}

//! Caller-facing `/v1` endpoints: task lifecycle, queue and quota.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use studio_core::{
    ArtifactRef, CreateTaskRequest, QueueStatus, QuotaSnapshot, Role, StudioError, TaskId, TaskKind, TaskRecord,
    TaskStatus,
};
use tracing::info;

use crate::error::ServerError;
use crate::extract::Caller;
use crate::state::AppState;

/// Upper bound for `?limit=` on the history endpoint.
const MAX_HISTORY_LIMIT: usize = 500;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/artifacts", get(task_artifacts))
        .route("/queue", get(queue_status))
        .route("/quota", get(quota))
        .route("/uploads/validate", post(validate_upload))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub kind: TaskKind,
    pub prompt: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Seconds.
    pub estimated_duration: u64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct UploadBody {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), ServerError> {
    if state.config.auto_register && state.studio.register_user(&caller.user_id, Role::Standard) {
        info!(user_id = %caller.user_id, "registered new user");
    }

    let task = state
        .studio
        .create_task(CreateTaskRequest {
            kind: body.kind,
            user_id: caller.user_id,
            prompt: body.prompt,
            parameters: body.parameters,
            client: caller.client,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            task_id: task.id(),
            status: task.status(),
            estimated_duration: task.estimated_duration_secs(),
        }),
    ))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<TaskRecord>>, ServerError> {
    let limit = q.limit.map(|l| l.min(MAX_HISTORY_LIMIT));
    let tasks = state.studio.list_user_tasks(&caller.user_id, limit).await?;
    Ok(Json(tasks))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<TaskId>,
) -> Result<Json<TaskRecord>, ServerError> {
    Ok(Json(state.studio.get_user_task(id, &caller.user_id).await?))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<TaskId>,
) -> Result<Json<Value>, ServerError> {
    let cancelled = state.studio.cancel_task(id, &caller.user_id).await?;
    Ok(Json(json!({ "task_id": id, "cancelled": cancelled })))
}

/// Files the task's executor stored, oldest first.
pub async fn task_artifacts(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<TaskId>,
) -> Result<Json<Vec<ArtifactRef>>, ServerError> {
    Ok(Json(state.studio.task_artifacts(id, &caller.user_id).await?))
}

pub async fn queue_status(State(state): State<Arc<AppState>>) -> Result<Json<QueueStatus>, ServerError> {
    Ok(Json(state.studio.get_queue_status().await?))
}

pub async fn quota(State(state): State<Arc<AppState>>, caller: Caller) -> Result<Json<QuotaSnapshot>, ServerError> {
    Ok(Json(state.studio.quota(&caller.user_id)?))
}

pub async fn validate_upload(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(body): Json<UploadBody>,
) -> Result<Json<Value>, ServerError> {
    let verdict = state.studio.validate_upload(
        &caller.client,
        Some(&caller.user_id),
        &body.filename,
        &body.content_type,
        body.size,
    );
    if !verdict.is_valid() {
        return Err(StudioError::AdmissionRejected {
            reason: "upload rejected".into(),
            threats: verdict.threat_strings(),
        }
        .into());
    }
    Ok(Json(json!({ "valid": true, "filename": body.filename })))
}

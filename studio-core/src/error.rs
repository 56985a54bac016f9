use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::runtime::types::{TaskId, TaskKind, TaskStatus};
use crate::security::SecurityAction;

/// Errors produced by the orchestration core.
///
/// Admission-time variants (`AdmissionRejected`, `QuotaExceeded`,
/// `RateLimited`) are returned synchronously from task creation and imply
/// that no task was persisted. Execution failures never appear here; they are
/// recorded on the task itself.
#[derive(Debug, Clone, Error)]
pub enum StudioError {
    /// A security threat or malformed input was detected.
    #[error("request rejected: {reason}")]
    AdmissionRejected { reason: String, threats: Vec<String> },

    /// A per-user resource limit would be exceeded.
    #[error("quota exceeded for '{resource}': {used} of {limit} used, {requested} requested")]
    QuotaExceeded {
        resource: String,
        limit: u64,
        used: u64,
        requested: u64,
        resets_at: Option<DateTime<Utc>>,
    },

    /// Transient rejection; retry after the given delay.
    #[error("rate limited by rule '{rule}' ({action})")]
    RateLimited {
        rule: String,
        action: SecurityAction,
        retry_after_secs: u64,
    },

    /// The referenced task does not exist (or has been swept).
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    /// The caller does not own the referenced task.
    #[error("user '{user_id}' does not own task {task_id}")]
    Forbidden { user_id: String, task_id: TaskId },

    /// The user has no quota account.
    #[error("unknown user: {user_id}")]
    UnknownUser { user_id: String },

    /// A lifecycle transition that the state machine does not allow.
    #[error("task {task_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Kind-specific parameters failed schema or range validation.
    #[error("invalid {kind} parameters: {message}")]
    InvalidParameters { kind: TaskKind, message: String },

    /// The scheduler no longer accepts work.
    #[error("scheduler is shut down")]
    SchedulerShutdown,

    /// A task store backend failed.
    #[error("task store error: {0}")]
    Store(String),
}

impl StudioError {
    /// `true` for the errors that are decided before a task exists.
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            StudioError::AdmissionRejected { .. }
                | StudioError::QuotaExceeded { .. }
                | StudioError::RateLimited { .. }
                | StudioError::UnknownUser { .. }
        )
    }
}

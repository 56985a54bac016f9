//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are converted to a JSON-body
//! HTTP response with an appropriate status code.
//!
//! Internal errors are logged with full detail but only a generic message is
//! returned to the caller.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use studio_core::StudioError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the orchestration core.
    #[error(transparent)]
    Studio(#[from] StudioError),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller did not identify itself.
    #[error("unauthorised: {0}")]
    Unauthorized(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let studio = match self {
            ServerError::Studio(err) => err,
            ServerError::BadRequest(m) => return error_body(StatusCode::BAD_REQUEST, json!({ "error": m })),
            ServerError::Unauthorized(m) => return error_body(StatusCode::UNAUTHORIZED, json!({ "error": m })),
        };

        match studio {
            StudioError::AdmissionRejected { reason, threats } => error_body(
                StatusCode::BAD_REQUEST,
                json!({ "error": reason, "threats": threats }),
            ),
            StudioError::InvalidParameters { kind, message } => error_body(
                StatusCode::BAD_REQUEST,
                json!({ "error": format!("invalid {kind} parameters"), "threats": [message] }),
            ),
            StudioError::RateLimited {
                rule,
                action,
                retry_after_secs,
            } => {
                let mut response = error_body(
                    StatusCode::TOO_MANY_REQUESTS,
                    json!({
                        "error": "rate limit exceeded",
                        "rule": rule,
                        "action": action,
                        "retry_after_secs": retry_after_secs,
                    }),
                );
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            StudioError::QuotaExceeded {
                resource,
                limit,
                used,
                requested,
                resets_at,
            } => error_body(
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": format!("quota exceeded for {resource}"),
                    "resource": resource,
                    "limit": limit,
                    "used": used,
                    "requested": requested,
                    "remaining": limit.saturating_sub(used),
                    "resets_at": resets_at,
                }),
            ),
            err @ StudioError::TaskNotFound { .. } => {
                error_body(StatusCode::NOT_FOUND, json!({ "error": err.to_string() }))
            }
            err @ (StudioError::Forbidden { .. } | StudioError::UnknownUser { .. }) => {
                error_body(StatusCode::FORBIDDEN, json!({ "error": err.to_string() }))
            }
            StudioError::SchedulerShutdown => error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "server is shutting down" }),
            ),
            err @ (StudioError::InvalidTransition { .. } | StudioError::Store(_)) => {
                error!(error = %err, "orchestration error");
                internal()
            }
        }
    }
}

fn error_body(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

fn internal() -> Response {
    error_body(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": "internal server error" }),
    )
}

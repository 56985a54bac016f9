use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::state::AppState;

/// Require `Authorization: Bearer <STUDIO_ADMIN_TOKEN>` when a token is
/// configured.
pub async fn admin_auth(State(state): State<Arc<AppState>>, req: Request<Body>, next: Next) -> Response {
    if let Some(expected) = state.config.admin_token.as_deref() {
        let provided = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if !provided.is_some_and(|token| token_matches(token, expected)) {
            warn!(path = %req.uri().path(), "rejected admin request without valid token");
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorised" }))).into_response();
        }
    }
    next.run(req).await
}

/// Compares sha256 digests of both tokens in constant time.
fn token_matches(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided.as_slice().ct_eq(expected.as_slice()).into()
}

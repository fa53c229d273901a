//! Bearer-token authentication for state-modifying/credential-surfacing
//! routes (webhook intake, chat bridge).
//!
//! Unlike a dev-mode-when-unset pattern, §4.11 requires these routes to
//! return 503 (not pass through) when no token is configured: an operator
//! who forgot to set the token should see the surface refuse to serve,
//! not silently open up.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::AppState;

pub async fn require_bearer_token(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(expected_hash) = &state.chat_bearer_hash else {
        return (StatusCode::SERVICE_UNAVAILABLE, "bearer token not configured").into_response();
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected_hash)) {
        return (StatusCode::UNAUTHORIZED, "invalid or missing bearer token").into_response();
    }

    next.run(req).await
}

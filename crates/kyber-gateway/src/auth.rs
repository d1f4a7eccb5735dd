//! Bearer-token auth middleware.
//!
//! Applied to every route except `/health` via `axum::middleware::from_fn_with_state`,
//! mirroring `skynet-gateway`'s own per-route `Authorization: Bearer` header
//! check in its webhook handler, generalized into shared middleware so
//! unauthenticated requests short-circuit with 401 before any handler body
//! runs.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use crate::routes::ApiError;
use crate::state::AppState;

const BEARER_PREFIX: &str = "Bearer ";

/// Constant-time byte comparison. Not `subtle::ConstantTimeEq` — nothing in
/// the corpus reaches for that crate elsewhere, and a fixed-cost
/// XOR-accumulate over the full token length is sufficient and auditable
/// for a single-operator bearer token.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub async fn require_bearer_token(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX));

    match provided {
        Some(token) if !state.auth_token.is_empty() && constant_time_eq(token.as_bytes(), state.auth_token.as_bytes()) => {
            Ok(next.run(request).await)
        }
        _ => Err(ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized")),
    }
}

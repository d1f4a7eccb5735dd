//! `POST /chat/turn`, `POST /chat/reset` — the dashboard's synchronous chat surface.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::routes::ApiError;
use crate::state::AppState;

/// Wall-clock bound on a single dashboard chat turn — shorter than the
/// agent's own 600 s per-message budget since the dashboard is a
/// synchronous, human-in-the-loop surface.
const CHAT_TURN_TIMEOUT: Duration = Duration::from_secs(180);

const MAX_SESSION_ID_LEN: usize = 64;

/// Replace any character outside `[A-Za-z0-9_.:-]` with `-`, trim leading
/// and trailing `-`, cap to 64 characters, and fall back to `"default"`
/// for an empty result.
pub fn normalize_session_id(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = replaced.trim_matches('-');
    let capped: String = trimmed.chars().take(MAX_SESSION_ID_LEN).collect();
    let capped = capped.trim_matches('-');

    if capped.is_empty() {
        "default".to_string()
    } else {
        capped.to_string()
    }
}

#[derive(Deserialize)]
pub struct ChatTurnRequest {
    message: String,
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

pub async fn chat_turn(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatTurnRequest>,
) -> Result<Json<Value>, ApiError> {
    let message = body.message.trim();
    if message.is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }

    let session_id = normalize_session_id(body.session_id.as_deref().unwrap_or(""));
    let session_key = format!("dashboard:{session_id}");

    let lock = state.lock_for(&session_key).await;
    let _guard = lock.lock().await;

    let turn = state
        .agent
        .process_direct(message, &session_key, "dashboard", &session_id, None);

    match tokio::time::timeout(CHAT_TURN_TIMEOUT, turn).await {
        Ok(Ok(response)) => Ok(Json(json!({
            "ok": true,
            "session_id": session_id,
            "response": response,
        }))),
        Ok(Err(e)) => Err(ApiError::internal(e.to_string())),
        Err(_) => Err(ApiError::timeout("chat turn timed out")),
    }
}

#[derive(Deserialize)]
pub struct ChatResetRequest {
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

pub async fn chat_reset(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatResetRequest>,
) -> Json<Value> {
    let session_id = normalize_session_id(body.session_id.as_deref().unwrap_or(""));
    let session_key = format!("dashboard:{session_id}");

    state.drop_lock(&session_key).await;
    let deleted = state.agent.sessions().delete(&session_key).await;

    Json(json!({
        "ok": true,
        "session_id": session_id,
        "deleted": deleted,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_app_state_with_response;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[test]
    fn test_normalize_session_id_replaces_invalid_chars() {
        assert_eq!(normalize_session_id("my session"), "my-session");
        assert_eq!(normalize_session_id("a/b?c"), "a-b-c");
    }

    #[test]
    fn test_normalize_session_id_empty_is_default() {
        assert_eq!(normalize_session_id(""), "default");
    }

    #[test]
    fn test_normalize_session_id_trims_separators() {
        assert_eq!(normalize_session_id("/leading-and-trailing/"), "leading-and-trailing");
    }

    #[test]
    fn test_normalize_session_id_caps_length() {
        let long = "a".repeat(100);
        let normalized = normalize_session_id(&long);
        assert_eq!(normalized.len(), MAX_SESSION_ID_LEN);
    }

    #[tokio::test]
    async fn test_chat_turn_returns_response_and_uses_dashboard_context() {
        let state = test_app_state_with_response("echo: hello").await;
        let router = crate::build_router(state.clone());

        let req = Request::builder()
            .method("POST")
            .uri("/chat/turn")
            .header("Authorization", "Bearer test-token")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&json!({"message": "hello", "sessionId": "my session"})).unwrap(),
            ))
            .unwrap();

        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["session_id"], json!("my-session"));
        assert_eq!(body["response"], json!("echo: hello"));
    }

    #[tokio::test]
    async fn test_chat_turn_requires_message() {
        let state = test_app_state_with_response("ok").await;
        let router = crate::build_router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/chat/turn")
            .header("Authorization", "Bearer test-token")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json!({"sessionId": "abc"})).unwrap()))
            .unwrap();

        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_reset_deletes_session() {
        let state = test_app_state_with_response("ok").await;
        let router = crate::build_router(state.clone());

        // First create the session via a chat turn.
        let turn_req = Request::builder()
            .method("POST")
            .uri("/chat/turn")
            .header("Authorization", "Bearer test-token")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&json!({"message": "hi", "sessionId": "group/1"})).unwrap(),
            ))
            .unwrap();
        router.clone().oneshot(turn_req).await.unwrap();

        let reset_req = Request::builder()
            .method("POST")
            .uri("/chat/reset")
            .header("Authorization", "Bearer test-token")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json!({"sessionId": "group/1"})).unwrap()))
            .unwrap();

        let response = router.oneshot(reset_req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["session_id"], json!("group-1"));
        assert_eq!(body["deleted"], json!(true));
    }
}

//! `POST /agent/turn` — inject a fire-and-forget message into the agent.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use kyber_core::bus::types::InboundMessage;

use crate::routes::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct AgentTurnRequest {
    message: String,
}

pub async fn agent_turn(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AgentTurnRequest>,
) -> Result<Json<Value>, ApiError> {
    let message = body.message.trim();
    if message.is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }

    let msg = InboundMessage::new("dashboard", "dashboard", "dashboard", message);
    state
        .agent
        .bus()
        .publish_inbound(msg)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(json!({ "ok": true, "message": "Message queued for agent" })))
}

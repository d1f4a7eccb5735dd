//! `GET /health` — the one unauthenticated route.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health(State(_state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "ok": true }))
}

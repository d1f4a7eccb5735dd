//! `GET /errors?limit=N`, `POST /errors/clear`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

const DEFAULT_LIMIT: usize = 200;

#[derive(Deserialize)]
pub struct ListErrorsQuery {
    limit: Option<usize>,
}

pub async fn list_errors(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListErrorsQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let errors = state.error_log.recent(limit);
    Json(json!({ "errors": errors }))
}

pub async fn clear_errors(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.error_log.clear();
    Json(json!({ "ok": true }))
}

//! Router construction — wires routes, auth middleware, and tracing.
//!
//! Grounded on `skynet-gateway`'s own `Router::new().route(...).with_state(state)
//! .layer(TraceLayer::new_for_http())` shape in `app.rs`/`main.rs`.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::require_bearer_token;
use crate::routes::{agent_turn, chat, errors, health, tasks};
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks/{task_ref}/cancel", post(tasks::cancel_task))
        .route("/tasks/{task_ref}/redeliver", post(tasks::redeliver_task))
        .route("/errors", get(errors::list_errors))
        .route("/errors/clear", post(errors::clear_errors))
        .route("/agent/turn", post(agent_turn::agent_turn))
        .route("/chat/turn", post(chat::chat_turn))
        .route("/chat/reset", post(chat::chat_reset))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_token));

    Router::new()
        .route("/health", get(health::health))
        .merge(authenticated)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

//! `GET /tasks`, `POST /tasks/{ref}/cancel`, `POST /tasks/{ref}/redeliver`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use kyber_agent::{Task, TaskStatus};
use kyber_core::bus::types::OutboundMessage;
use kyber_core::utils::redact_secrets;

use crate::routes::ApiError;
use crate::state::AppState;

const HISTORY_LIMIT: usize = 100;

/// Dashboard-visible iff the task isn't internal/system-originated and its
/// label doesn't name a heartbeat check — these are housekeeping noise, not
/// user-facing work.
fn is_dashboard_visible(task: &Task) -> bool {
    let internal_origin = matches!(task.origin_channel.as_str(), "internal" | "system");
    let heartbeat_label = task.label.to_lowercase().contains("heartbeat");
    !internal_origin && !heartbeat_label
}

/// Render a `Task` to its dashboard JSON shape, with free-text fields
/// passed through `redact_secrets` (§7) before they leave the process.
fn task_to_json(task: &Task) -> Value {
    json!({
        "id": task.id,
        "reference": task.reference,
        "completion_reference": task.completion_reference,
        "label": redact_secrets(&task.label),
        "description": redact_secrets(&task.description),
        "status": match task.status {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        },
        "origin_channel": task.origin_channel,
        "origin_chat_id": task.origin_chat_id,
        "created_at": task.created_at,
        "started_at": task.started_at,
        "completed_at": task.completed_at,
        "iteration": task.iteration,
        "max_iterations": task.max_iterations,
        "current_action": task.current_action.as_deref().map(redact_secrets),
        "actions_completed": task
            .actions_completed
            .iter()
            .rev()
            .take(10)
            .rev()
            .map(|a| redact_secrets(a))
            .collect::<Vec<_>>(),
        "result": task.result.as_deref().map(redact_secrets),
        "error": task.error.as_deref().map(redact_secrets),
    })
}

pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Value> {
    let registry = state.agent.task_registry();

    let active: Vec<Value> = registry
        .get_active_tasks()
        .await
        .iter()
        .filter(|t| is_dashboard_visible(t))
        .map(task_to_json)
        .collect();

    let history: Vec<Value> = registry
        .get_history(HISTORY_LIMIT)
        .await
        .iter()
        .filter(|t| t.status.is_terminal() && is_dashboard_visible(t))
        .map(task_to_json)
        .collect();

    Json(json!({ "active": active, "history": history }))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_ref): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let registry = state.agent.task_registry();
    let task = registry
        .get_by_ref(&task_ref)
        .await
        .ok_or_else(|| ApiError::not_found("Task not found"))?;

    if task.status.is_terminal() {
        return Ok(Json(json!({ "ok": true, "status": status_str(task.status) })));
    }

    let aborted = state.agent.cancel_task(&task.id).await;
    if !aborted {
        // No runner handle (already finishing, or never tracked) but the
        // task is still marked active — force it terminal so the dashboard
        // doesn't show a task stuck "running" forever.
        registry.mark_cancelled(&task.id).await;
    }

    let confirmation = OutboundMessage::new(
        task.origin_channel.clone(),
        task.origin_chat_id.clone(),
        format!("Task cancelled from dashboard: {} ({})", task.label, task.reference),
    );
    let _ = state.agent.bus().publish_outbound(confirmation).await;

    Ok(Json(json!({ "ok": true, "status": "cancelled" })))
}

pub async fn redeliver_task(
    State(state): State<Arc<AppState>>,
    Path(task_ref): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let registry = state.agent.task_registry();
    let task = registry
        .get_by_ref(&task_ref)
        .await
        .ok_or_else(|| ApiError::not_found("Task not found"))?;

    let payload = task
        .result
        .clone()
        .or_else(|| task.error.clone())
        .unwrap_or_default();
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(Json(json!({ "ok": false, "detail": "No output to deliver" })));
    }

    let content = if payload.starts_with("⚡️") {
        payload.to_string()
    } else {
        format!("⚡️ {payload}")
    };

    let mut msg = OutboundMessage::new(task.origin_channel.clone(), task.origin_chat_id.clone(), content);
    msg.is_background = true;
    msg.metadata.insert("source".to_string(), "redeliver".to_string());
    msg.metadata.insert("task_id".to_string(), task.id.clone());

    state
        .agent
        .bus()
        .publish_outbound(msg)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(json!({ "ok": true })))
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Queued => "queued",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

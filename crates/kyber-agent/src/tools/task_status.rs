//! Task status tool — lets the agent answer "what's the status of ⚡abc12345"
//! for a background task without a dashboard round-trip.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::base::{require_string, Tool};
use crate::task_registry::TaskRegistry;

/// Tool that reports the status of a background task by reference.
pub struct TaskStatusTool {
    registry: Arc<TaskRegistry>,
}

impl TaskStatusTool {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for TaskStatusTool {
    fn name(&self) -> &str {
        "task_status"
    }

    fn description(&self) -> &str {
        "Check the status of a background task by its reference token \
         (e.g. ⚡abc12345, ✅abc12345, or the bare 8-hex id)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reference": {
                    "type": "string",
                    "description": "The task's reference token or bare id"
                }
            },
            "required": ["reference"]
        })
    }

    fn toolset(&self) -> &str {
        "tasks"
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let reference = require_string(&params, "reference")?;
        match self.registry.get_status_for_ref(&reference).await {
            Some(status) => Ok(status),
            None => Ok(format!("No task found for reference '{reference}'.")),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> (Arc<TaskRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let reg = Arc::new(TaskRegistry::new(dir.path().to_path_buf()).await.unwrap());
        (reg, dir)
    }

    #[tokio::test]
    async fn test_reports_running_task() {
        let (reg, _dir) = registry().await;
        let task = reg.create("do the thing", "thing", "telegram", "chat_1").await;
        reg.mark_started(&task.id).await;

        let tool = TaskStatusTool::new(reg.clone());
        let mut params = HashMap::new();
        params.insert("reference".into(), json!(task.reference));

        let result = tool.execute(params).await.unwrap();
        assert!(result.contains("running"));
    }

    #[tokio::test]
    async fn test_reports_unknown_reference() {
        let (reg, _dir) = registry().await;
        let tool = TaskStatusTool::new(reg);
        let mut params = HashMap::new();
        params.insert("reference".into(), json!("⚡deadbeef"));

        let result = tool.execute(params).await.unwrap();
        assert!(result.contains("No task found"));
    }

    #[tokio::test]
    async fn test_tool_definition() {
        let (reg, _dir) = registry().await;
        let tool = TaskStatusTool::new(reg);
        let def = tool.to_definition();
        assert_eq!(def.function.name, "task_status");
    }
}

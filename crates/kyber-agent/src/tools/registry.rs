//! Tool Registry — thread-safe store matching nanobot's `ToolRegistry`.
//!
//! The agent loop registers tools here and dispatches LLM tool-call requests
//! by name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kyber_core::types::ToolDefinition;
use serde_json::json;
use tracing::{info, warn};

use super::base::{missing_required_params, Tool};

/// Every tool call is bounded by this wall-clock floor, regardless of what
/// the tool itself would otherwise wait for (a hung subprocess, a stalled
/// HTTP fetch). One misbehaving tool should cost a turn, not the process.
const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Tool results longer than this are truncated before being handed back to
/// the LLM — a runaway `read_file`/`exec` output shouldn't blow the context
/// window on its own.
const MAX_RESULT_CHARS: usize = 100_000;

fn truncate_result(s: String) -> String {
    if s.chars().count() <= MAX_RESULT_CHARS {
        return s;
    }
    let kept: String = s.chars().take(MAX_RESULT_CHARS).collect();
    format!(
        "{kept}\n\n[... output truncated, {} characters omitted ...]",
        s.chars().count() - MAX_RESULT_CHARS
    )
}

// ─────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────

/// Stores tools keyed by name and dispatches calls.
///
/// Owns `Arc<dyn Tool>` so tools can be shared across threads.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Overwrites any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        info!(tool = tool.name(), "registered tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name. Returns the removed tool, if any.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        let removed = self.tools.remove(name);
        if removed.is_some() {
            info!(tool = name, "unregistered tool");
        }
        removed
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Check if a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Names of all registered tools, sorted for determinism.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the LLM-facing definitions for registered tools, optionally
    /// filtered.
    ///
    /// - `toolsets`: if given, only tools whose `toolset()` is in this list.
    /// - `tool_names`: if given, only tools whose `name()` is in this list
    ///   (applied in addition to `toolsets`, not instead of it).
    /// - `include_unavailable`: if `false` (the default caller behavior),
    ///   tools reporting `is_available() == false` are dropped — e.g. a web
    ///   search tool with no API key configured shouldn't even be offered to
    ///   the LLM as an option it could pick and then fail.
    pub fn get_definitions(
        &self,
        toolsets: Option<&[String]>,
        tool_names: Option<&[String]>,
        include_unavailable: bool,
    ) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| include_unavailable || t.is_available())
            .filter(|t| toolsets.map(|ts| ts.iter().any(|s| s == t.toolset())).unwrap_or(true))
            .filter(|t| tool_names.map(|ns| ns.iter().any(|n| n == t.name())).unwrap_or(true))
            .map(|t| t.to_definition())
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Execute a tool by name with the given parameters.
    ///
    /// Always returns a JSON-encoded string so the LLM can rely on a
    /// consistent error shape: success is the tool's own output, failure is
    /// `{"error": "<message>"}` (unknown tool, invalid parameters, call
    /// timeout, or propagated exception). Parameters are validated against
    /// the tool's own `parameters()` schema before dispatch, so a call
    /// missing a required field never reaches the tool's handler. Results
    /// are truncated at `MAX_RESULT_CHARS`.
    pub async fn execute(&self, name: &str, params: HashMap<String, serde_json::Value>) -> String {
        let tool = match self.tools.get(name) {
            Some(t) => t.clone(),
            None => {
                warn!(tool = name, "tool not found");
                return json!({"error": format!("Tool '{name}' not found")}).to_string();
            }
        };

        let missing = missing_required_params(&tool.parameters(), &params);
        if !missing.is_empty() {
            warn!(tool = name, missing = ?missing, "tool call missing required parameters");
            return json!({
                "error": format!(
                    "Invalid parameters for tool '{name}': missing required parameter(s): {}",
                    missing.join(", ")
                )
            })
            .to_string();
        }

        match tokio::time::timeout(TOOL_CALL_TIMEOUT, tool.execute(params)).await {
            Ok(Ok(result)) => truncate_result(result),
            Ok(Err(e)) => {
                warn!(tool = name, error = %e, "tool execution failed");
                json!({"error": e.to_string()}).to_string()
            }
            Err(_elapsed) => {
                warn!(tool = name, timeout_secs = TOOL_CALL_TIMEOUT.as_secs(), "tool call timed out");
                json!({"error": format!("Tool '{name}' timed out after {}s", TOOL_CALL_TIMEOUT.as_secs())}).to_string()
            }
        }
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}



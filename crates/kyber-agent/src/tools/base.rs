//! Tool trait — the abstract interface every agent tool must implement.
//!
//! Port of nanobot's `agent/tools/base.py` `Tool` ABC.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use kyber_core::types::ToolDefinition;

// ─────────────────────────────────────────────
// Tool trait
// ─────────────────────────────────────────────

/// Every agent tool implements this trait.
///
/// The agent loop discovers tools via `name()`, sends their schemas to the LLM
/// via `to_definition()`, and dispatches calls via `execute()`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used by the LLM to call this tool (e.g. `"read_file"`).
    fn name(&self) -> &str;

    /// Human-readable description shown to the LLM.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters (as a `serde_json::Value`).
    ///
    /// Must be `{"type": "object", "properties": {...}, "required": [...]}`.
    fn parameters(&self) -> Value;

    /// Execute the tool with the given arguments.
    ///
    /// Returns the tool output as a string (the LLM reads this).
    /// On failure, return an `Err` — the registry will catch it and
    /// convert to an error string for the LLM.
    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String>;

    /// Build the `ToolDefinition` sent to the LLM.
    ///
    /// Default implementation — rarely needs overriding.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }

    /// Grouping label used to filter `ToolRegistry::get_definitions` by
    /// toolset (e.g. `"filesystem"`, `"web"`, `"messaging"`). Tools that
    /// don't belong to a named group default to `"core"`.
    fn toolset(&self) -> &str {
        "core"
    }

    /// Whether this tool can currently be offered to the LLM.
    ///
    /// Defaults to always-available. Tools that depend on optional
    /// configuration (an API key, a registered channel) override this to
    /// report `false` rather than failing at call time.
    fn is_available(&self) -> bool {
        true
    }
}

// ─────────────────────────────────────────────
// Param helpers
// ─────────────────────────────────────────────

/// Check `params` against a tool's `parameters()` JSON Schema `required` array.
///
/// Returns the names of any required keys missing from `params`. Only
/// presence is checked (not type) — the tool's own `execute()` still does
/// the type-specific extraction via `require_string`/etc. and can reject
/// malformed values itself.
pub fn missing_required_params(schema: &Value, params: &HashMap<String, Value>) -> Vec<String> {
    schema["required"]
        .as_array()
        .map(|required| {
            required
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|key| !params.contains_key(*key))
                .map(|key| key.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Extract a required `String` param, returning a user-friendly error.
pub fn require_string(params: &HashMap<String, Value>, key: &str) -> anyhow::Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {key}"))
}

/// Extract an optional `String` param.
pub fn optional_string(params: &HashMap<String, Value>, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Extract an optional integer param.
pub fn optional_i64(params: &HashMap<String, Value>, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// Extract an optional boolean param (defaults to `false` if absent).
pub fn optional_bool(params: &HashMap<String, Value>, key: &str) -> bool {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}



//! Agent loop — the LLM ↔ tool-calling main loop.
//!
//! Port of nanobot's `agent/loop.py`.
//! Receives inbound messages, builds context, calls the LLM, dispatches
//! tool calls, and publishes outbound responses.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use kyber_core::bus::queue::MessageBus;
use kyber_core::bus::types::{InboundMessage, OutboundMessage, StatusUpdate};
use kyber_core::session::manager::SessionManager;
use kyber_core::types::{Message, ToolCall};
use kyber_providers::traits::{LlmProvider, LlmRequestConfig};

use crate::context::ContextBuilder;
use crate::subagent::SubagentManager;
use crate::task_registry::TaskRegistry;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::message::MessageTool;
use crate::tools::registry::ToolRegistry;
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::task_status::TaskStatusTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};

/// Default maximum LLM ↔ tool iterations per user message. `0` means
/// unlimited (bounded only by the per-message wall-clock budget).
const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Per single LLM call budget.
const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-message wall-clock budget covering the entire tool-calling loop.
const PER_MESSAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// Configuration for the exec tool.
#[derive(Clone, Debug)]
pub struct ExecToolConfig {
    /// Timeout in seconds (default 60).
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

// ─────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────

/// The main agent loop: polls the message bus, calls the LLM, dispatches tools.
pub struct AgentLoop {
    /// Message bus for inbound/outbound messages.
    bus: Arc<MessageBus>,
    /// LLM provider.
    provider: Arc<dyn LlmProvider>,
    /// Workspace root.
    workspace: PathBuf,
    /// Model to use (overrides provider default if set).
    model: String,
    /// Max LLM ↔ tool iterations per message. `0` = unlimited.
    max_iterations: usize,
    /// LLM request config (temperature, max_tokens).
    request_config: LlmRequestConfig,
    /// Tool registry.
    tools: ToolRegistry,
    /// Context builder.
    context: ContextBuilder,
    /// Session manager.
    sessions: SessionManager,
    /// Reference to the message tool (for set_context).
    message_tool: Arc<MessageTool>,
    /// Spawn tool reference (for set_context).
    spawn_tool: Arc<SpawnTool>,
    /// Subagent manager (also held by SpawnTool; kept for direct access).
    #[allow(dead_code)]
    subagent_manager: Arc<SubagentManager>,
    /// Background task lifecycle + durable history.
    task_registry: Arc<TaskRegistry>,
    /// Running-task cancellation handles, keyed by both `session_key` (from
    /// the moment a handler task is spawned) and task id (once a turn
    /// creates a `Task`) so `cancel_task` can look a task up either way.
    /// Lives alongside the registry rather than inside it: the registry
    /// owns `Task` records, not runtime handles.
    running_handles: Arc<RwLock<HashMap<String, AbortHandle>>>,
}

impl AgentLoop {
    /// Create a new agent loop.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        workspace: PathBuf,
        model: Option<String>,
        max_iterations: Option<usize>,
        request_config: Option<LlmRequestConfig>,
        brave_api_key: Option<String>,
        exec_config: Option<ExecToolConfig>,
        restrict_to_workspace: bool,
        session_manager: Option<SessionManager>,
        agent_name: Option<String>,
        task_registry: Option<Arc<TaskRegistry>>,
    ) -> Result<Self> {
        let model = model.unwrap_or_else(|| provider.default_model().to_string());
        let max_iterations = max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
        let request_config = request_config.unwrap_or_default();
        let exec_config = exec_config.unwrap_or_default();
        let agent_name = agent_name.unwrap_or_else(|| "Kyber".into());
        let sessions =
            session_manager.unwrap_or_else(|| SessionManager::new(None).expect("failed to create session manager"));

        let task_registry = match task_registry {
            Some(tr) => tr,
            None => Arc::new(TaskRegistry::new(kyber_core::utils::get_data_path()).await?),
        };

        let context = ContextBuilder::new(&workspace, &agent_name);

        // Build tool registry
        let mut tools = ToolRegistry::new();
        let allowed_dir = if restrict_to_workspace {
            Some(workspace.clone())
        } else {
            None
        };

        tools.register(Arc::new(ReadFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(WriteFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(EditFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(ListDirTool::new(allowed_dir)));
        tools.register(Arc::new(ExecTool::new(
            workspace.clone(),
            Some(exec_config.timeout),
            restrict_to_workspace,
        )));
        tools.register(Arc::new(WebSearchTool::new(brave_api_key.clone())));
        tools.register(Arc::new(WebFetchTool::new()));
        tools.register(Arc::new(TaskStatusTool::new(task_registry.clone())));

        let message_tool = Arc::new(MessageTool::new(None));
        tools.register(message_tool.clone());

        // Subagent manager + spawn tool
        let subagent_manager = Arc::new(SubagentManager::new(
            provider.clone(),
            workspace.clone(),
            bus.clone(),
            model.clone(),
            brave_api_key,
            exec_config,
            restrict_to_workspace,
            request_config.clone(),
        ));

        let spawn_tool = Arc::new(SpawnTool::new(subagent_manager.clone()));
        tools.register(spawn_tool.clone());

        info!(
            model = %model,
            tools = tools.len(),
            max_iterations = max_iterations,
            "agent loop initialized"
        );

        Ok(Self {
            bus,
            provider,
            workspace,
            model,
            max_iterations,
            request_config,
            tools,
            context,
            sessions,
            message_tool,
            spawn_tool,
            subagent_manager,
            task_registry,
            running_handles: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Run the event loop: poll inbound messages and process them.
    ///
    /// Each inbound message spawns its own handler task so multiple chats
    /// progress concurrently; this method itself never awaits per-message
    /// work, only the next message to arrive.
    pub async fn run(self: &Arc<Self>) {
        info!("agent loop started, waiting for messages");
        loop {
            match self.bus.consume_inbound().await {
                Some(msg) => {
                    let session_key = msg.session_key();
                    debug!(session_key = %session_key, "received message, spawning handler");

                    let agent = Arc::clone(self);
                    let jh = tokio::spawn(async move {
                        agent.handle_inbound(msg).await;
                    });
                    self.running_handles
                        .write()
                        .await
                        .insert(session_key, jh.abort_handle());
                }
                None => {
                    info!("inbound channel closed, agent loop exiting");
                    break;
                }
            }
        }
    }

    /// Handler body spawned per inbound message by `run`.
    async fn handle_inbound(self: Arc<Self>, msg: InboundMessage) {
        let session_key = msg.session_key();

        let result = if msg.channel == "system" && msg.sender_id == "subagent" {
            self.process_system_message(&msg).await
        } else {
            self.process_message(&msg).await
        };

        match result {
            Ok(response) => {
                if let Err(e) = self.bus.publish_outbound(response).await {
                    error!(error = %e, "failed to publish outbound message");
                }
            }
            Err(e) => {
                error!(error = %e, session_key = %session_key, "message processing error");
                let err_msg = OutboundMessage::new(
                    &msg.channel,
                    &msg.chat_id,
                    &format!("I encountered an error: {e}"),
                );
                let _ = self.bus.publish_outbound(err_msg).await;
            }
        }
    }

    /// Process a single inbound message → outbound response.
    ///
    /// Holds the session's lock across the whole read-turn-write sequence
    /// (mirroring the gateway's `/chat/turn` route) so two inbound messages
    /// for the same session can't interleave their user/assistant appends.
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        let session_key = msg.session_key();
        let media_paths: Vec<String> = msg.media.iter().map(|m| m.path.clone()).collect();

        let lock = self.sessions.lock_for(&session_key).await;
        let _guard = lock.lock().await;

        let content = match tokio::time::timeout(
            PER_MESSAGE_TIMEOUT,
            self.run_turn(&msg.content, &media_paths, &msg.channel, &msg.chat_id, &session_key, None),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(session_key = %session_key, "turn exceeded the per-message budget");
                "I've run out of time working on that. Please try again.".to_string()
            }
        };

        self.sessions.add_message(&session_key, Message::user(&msg.content)).await;
        self.sessions.add_message(&session_key, Message::assistant(&content)).await;

        Ok(OutboundMessage::new(&msg.channel, &msg.chat_id, &content))
    }

    /// Process a system message (from a subagent or cron).
    ///
    /// Parses the original `channel:chat_id` from `msg.chat_id`,
    /// loads the original session, runs a full LLM call to summarize
    /// the result, and routes the response back to the correct channel.
    async fn process_system_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        info!(
            sender = %msg.sender_id,
            chat_id = %msg.chat_id,
            "processing system message"
        );

        // Parse origin from chat_id format "channel:chat_id"
        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((ch, cid)) => (ch.to_string(), cid.to_string()),
            None => {
                return Err(anyhow::anyhow!(
                    "Invalid system message chat_id format: {}",
                    msg.chat_id
                ));
            }
        };

        let session_key = format!("{origin_channel}:{origin_chat_id}");

        let lock = self.sessions.lock_for(&session_key).await;
        let _guard = lock.lock().await;

        let content = match tokio::time::timeout(
            PER_MESSAGE_TIMEOUT,
            self.run_turn(&msg.content, &[], &origin_channel, &origin_chat_id, &session_key, None),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(session_key = %session_key, "system message turn exceeded the per-message budget");
                "I've run out of time summarizing that result.".to_string()
            }
        };

        self.sessions.add_message(&session_key, Message::user(&msg.content)).await;
        self.sessions.add_message(&session_key, Message::assistant(&content)).await;

        Ok(OutboundMessage::new(&origin_channel, &origin_chat_id, &content))
    }

    /// Direct processing mode (CLI entry point, gateway `/chat/turn`, cron, heartbeat).
    ///
    /// If `tracked_task_id` is provided, the caller already created and
    /// started that `Task` and owns its terminal transition; otherwise this
    /// turn creates one implicitly on its first tool call and auto-finalizes it.
    pub async fn process_direct(
        &self,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        tracked_task_id: Option<String>,
    ) -> Result<String> {
        let lock = self.sessions.lock_for(session_key).await;
        let _guard = lock.lock().await;

        let answer = match tokio::time::timeout(
            PER_MESSAGE_TIMEOUT,
            self.run_turn(content, &[], channel, chat_id, session_key, tracked_task_id),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("turn exceeded the per-message time budget"),
        };

        self.sessions.add_message(session_key, Message::user(content)).await;
        self.sessions.add_message(session_key, Message::assistant(&answer)).await;

        Ok(answer)
    }

    /// The core tool-calling loop shared by every entry point above.
    ///
    /// On the first tool call of the turn (when `tracked_task_id` is `None`)
    /// an implicit `Task` is created and started; subsequent tool calls
    /// update its progress. A status-stream (`STATUS_START`/line.../`STATUS_END`)
    /// brackets the turn once any tool call is made.
    async fn run_turn(
        &self,
        user_text: &str,
        media_paths: &[String],
        channel: &str,
        chat_id: &str,
        session_key: &str,
        tracked_task_id: Option<String>,
    ) -> Result<String> {
        self.message_tool.set_context(channel, chat_id).await;
        self.spawn_tool.set_context(channel, chat_id).await;

        let history = self.sessions.get_history(session_key, 50).await;
        let active_summary = self.task_registry.get_context_summary().await;
        let active_tasks = if active_summary.trim().is_empty() {
            None
        } else {
            Some(active_summary.as_str())
        };

        let mut messages = self
            .context
            .build_messages(&history, user_text, media_paths, channel, chat_id, active_tasks);
        let tool_defs = self.tools.get_definitions(None, None, false);

        let mut task_id = tracked_task_id.clone();
        let own_finalize = tracked_task_id.is_none();
        let mut status_started = false;

        let iterations_cap = if self.max_iterations == 0 {
            usize::MAX
        } else {
            self.max_iterations
        };

        let mut final_content: Option<String> = None;
        let mut iteration = 0usize;

        loop {
            if iteration >= iterations_cap {
                final_content =
                    Some("I've hit my iteration limit for this turn and need to stop here.".into());
                break;
            }
            iteration += 1;
            debug!(iteration = iteration, "LLM call");

            let response = match tokio::time::timeout(
                LLM_CALL_TIMEOUT,
                self.provider.chat(&messages, Some(&tool_defs), &self.model, &self.request_config),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => {
                    warn!(session_key = %session_key, "LLM call timed out");
                    final_content = Some("The model took too long to respond. Please try again.".into());
                    break;
                }
            };

            if response.has_tool_calls() {
                if task_id.is_none() {
                    let label: String = user_text.chars().take(80).collect();
                    if let Some(dup) = self
                        .task_registry
                        .find_active_duplicate(&label, user_text, channel, chat_id)
                        .await
                    {
                        debug!(duplicate_of = %dup.id, "turn resembles an already-running task, proceeding anyway");
                    }
                    let task = self.task_registry.create(user_text, label, channel, chat_id).await;
                    self.task_registry.mark_started(&task.id).await;
                    self.adopt_handle(session_key, &task.id).await;
                    task_id = Some(task.id);
                }

                if !status_started {
                    status_started = true;
                    let _ = self
                        .bus
                        .publish_status(StatusUpdate::start(channel, chat_id, session_key))
                        .await;
                    let intro = format!("Working on: {}", truncate_for_status(user_text));
                    let _ = self
                        .bus
                        .publish_status(StatusUpdate::new(channel, chat_id, session_key, intro))
                        .await;
                }

                let tool_calls: Vec<ToolCall> = response.tool_calls.clone();
                ContextBuilder::add_assistant_message(&mut messages, response.content.clone(), tool_calls.clone());

                for tc in &tool_calls {
                    let params: HashMap<String, serde_json::Value> =
                        serde_json::from_str(&tc.function.arguments).unwrap_or_default();

                    info!(tool = %tc.function.name, iteration = iteration, "executing tool call");

                    let started = Instant::now();
                    let result = self.tools.execute(&tc.function.name, params).await;
                    let elapsed = started.elapsed();

                    debug!(tool = %tc.function.name, result_len = result.len(), "tool result");

                    let status_line = format!(
                        "→ {} ({}) [{:.1}s]",
                        tc.function.name,
                        arg_preview(&tc.function.arguments),
                        elapsed.as_secs_f64()
                    );
                    let _ = self
                        .bus
                        .publish_status(StatusUpdate::new(channel, chat_id, session_key, status_line.clone()))
                        .await;

                    if let Some(tid) = &task_id {
                        self.task_registry
                            .update_progress(tid, tc.function.name.clone(), Some(status_line))
                            .await;
                    }

                    ContextBuilder::add_tool_result(&mut messages, &tc.id, &result);
                }
            } else {
                final_content = response.content;
                break;
            }
        }

        if status_started {
            let _ = self.bus.publish_status(StatusUpdate::end(channel, chat_id, session_key)).await;
        }

        let content = final_content
            .unwrap_or_else(|| "I've completed processing but have no response to give.".into());

        if let Some(tid) = &task_id {
            self.release_handle(session_key, tid).await;
            if own_finalize {
                self.task_registry.mark_completed(tid, content.clone()).await;
            }
        }

        Ok(content)
    }

    /// Cooperative cancellation: look up the running task handle, abort it,
    /// and mark the task cancelled. Returns `false` if no handle is found
    /// (already completed, or never tracked).
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let handle = self.running_handles.write().await.remove(task_id);
        match handle {
            Some(h) => {
                if h.is_finished() {
                    false
                } else {
                    h.abort();
                    self.task_registry.mark_cancelled(task_id).await;
                    true
                }
            }
            None => false,
        }
    }

    /// Copy the per-message handler's abort handle (registered under
    /// `session_key` by `run`) under `task_id` too, so `cancel_task` can
    /// find it once a turn's first tool call creates the `Task`.
    async fn adopt_handle(&self, session_key: &str, task_id: &str) {
        let handle = self.running_handles.read().await.get(session_key).cloned();
        if let Some(handle) = handle {
            self.running_handles.write().await.insert(task_id.to_string(), handle);
        }
    }

    /// Drop both the `session_key` and `task_id` entries once a turn finishes
    /// naturally (not via cancellation, which removes its own entry).
    async fn release_handle(&self, session_key: &str, task_id: &str) {
        let mut handles = self.running_handles.write().await;
        handles.remove(session_key);
        handles.remove(task_id);
    }

    /// Get a reference to the tool registry (for testing/extension).
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get a reference to the task registry (for the gateway API and tests).
    pub fn task_registry(&self) -> &Arc<TaskRegistry> {
        &self.task_registry
    }

    /// Get a reference to the message bus (for the gateway API's cancel
    /// confirmations and redeliver).
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Get a reference to the session manager (for the gateway API's
    /// `/chat/reset`).
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }
}

// ─────────────────────────────────────────────
// Status / logging helpers
// ─────────────────────────────────────────────

/// Collapse whitespace and cap a tool's raw JSON arguments to a short
/// preview suitable for a one-line status update.
fn arg_preview(args: &str) -> String {
    const MAX: usize = 80;
    let compact: String = args.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() > MAX {
        let truncated: String = compact.chars().take(MAX).collect();
        format!("{truncated}…")
    } else {
        compact
    }
}

/// Cap the user text echoed in the "Working on: ..." intro status line.
fn truncate_for_status(text: &str) -> String {
    const MAX: usize = 120;
    if text.chars().count() > MAX {
        let truncated: String = text.chars().take(MAX).collect();
        format!("{truncated}…")
    } else {
        text.to_string()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kyber_core::types::{LlmResponse, ToolDefinition};

    /// A mock LLM provider that returns canned responses.
    struct MockProvider {
        /// Responses to return in sequence.
        responses: std::sync::Mutex<Vec<LlmResponse>>,
    }

    impl MockProvider {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: std::sync::Mutex::new(responses),
            }
        }

        fn simple(text: &str) -> Self {
            Self::new(vec![LlmResponse {
                content: Some(text.into()),
                ..Default::default()
            }])
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> LlmResponse {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                LlmResponse {
                    content: Some("(no more responses)".into()),
                    ..Default::default()
                }
            } else {
                responses.remove(0)
            }
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn display_name(&self) -> &str {
            "MockProvider"
        }
    }

    async fn create_test_loop(provider: Arc<dyn LlmProvider>) -> AgentLoop {
        let bus = Arc::new(MessageBus::new(32));
        let workspace = tempfile::tempdir().unwrap().keep();
        let data_dir = tempfile::tempdir().unwrap().keep();

        AgentLoop::new(
            bus,
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            Some(Arc::new(TaskRegistry::new(data_dir).await.unwrap())),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_agent_simple_response() {
        let provider = Arc::new(MockProvider::simple("Hello from Kyber!"));
        let agent = create_test_loop(provider).await;

        let result = agent
            .process_direct("Hi", "cli:direct", "cli", "direct", None)
            .await
            .unwrap();
        assert_eq!(result, "Hello from Kyber!");

        // No tool calls → no task should have been created.
        assert!(agent.task_registry.get_history(10).await.is_empty());
        assert!(agent.task_registry.get_active_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_agent_tool_calling() {
        // First response: LLM requests read_file tool call
        // Second response: LLM gives final answer
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("test.txt");
        std::fs::write(&test_file, "file content here").unwrap();

        let tool_call = ToolCall::new(
            "call_1",
            "read_file",
            serde_json::json!({"path": test_file.to_str().unwrap()}).to_string(),
        );

        let responses = vec![
            LlmResponse {
                content: None,
                tool_calls: vec![tool_call],
                ..Default::default()
            },
            LlmResponse {
                content: Some("The file contains: file content here".into()),
                ..Default::default()
            },
        ];

        let provider = Arc::new(MockProvider::new(responses));
        let bus = Arc::new(MessageBus::new(32));
        let data_dir = tempfile::tempdir().unwrap().keep();

        let agent = AgentLoop::new(
            bus,
            provider,
            dir.path().to_path_buf(),
            None,
            Some(10),
            None,
            None,
            None,
            false,
            None,
            None,
            Some(Arc::new(TaskRegistry::new(data_dir).await.unwrap())),
        )
        .await
        .unwrap();

        let result = agent
            .process_direct("Read test.txt", "cli:direct", "cli", "direct", None)
            .await
            .unwrap();
        assert_eq!(result, "The file contains: file content here");

        // A tool call happened → an implicit task should have been created
        // and auto-finalized as completed.
        let history = agent.task_registry.get_history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, crate::task_registry::TaskStatus::Completed);
        assert_eq!(history[0].result.as_deref(), Some("The file contains: file content here"));
        assert!(!history[0].actions_completed.is_empty());
    }

    #[tokio::test]
    async fn test_agent_max_iterations() {
        // All responses are tool calls → should exhaust max_iterations
        let tool_call = ToolCall::new("call_loop", "list_dir", r#"{"path": "/tmp"}"#);
        let responses: Vec<LlmResponse> = (0..10)
            .map(|_| LlmResponse {
                content: None,
                tool_calls: vec![tool_call.clone()],
                ..Default::default()
            })
            .collect();

        let provider = Arc::new(MockProvider::new(responses));
        let agent = create_test_loop(provider).await;

        let result = agent
            .process_direct("loop forever", "cli:direct", "cli", "direct", None)
            .await
            .unwrap();
        assert!(result.contains("iteration limit"));
    }

    #[tokio::test]
    async fn test_default_tools_registered() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider).await;

        let names = agent.tools().tool_names();
        assert!(names.contains(&"read_file".into()));
        assert!(names.contains(&"write_file".into()));
        assert!(names.contains(&"edit_file".into()));
        assert!(names.contains(&"list_dir".into()));
        assert!(names.contains(&"exec".into()));
        assert!(names.contains(&"web_search".into()));
        assert!(names.contains(&"web_fetch".into()));
        assert!(names.contains(&"message".into()));
        assert!(names.contains(&"spawn".into()));
        assert!(names.contains(&"task_status".into()));
        assert_eq!(names.len(), 10);
    }

    #[tokio::test]
    async fn test_model_defaults_to_provider() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider).await;
        assert_eq!(agent.model(), "mock-model");
    }

    #[test]
    fn test_exec_tool_config_default() {
        let config = ExecToolConfig::default();
        assert_eq!(config.timeout, 60);
    }

    #[tokio::test]
    async fn test_process_system_message() {
        let provider = Arc::new(MockProvider::simple("Here's a summary of the result."));
        let bus = Arc::new(MessageBus::new(32));
        let workspace = tempfile::tempdir().unwrap().keep();
        let data_dir = tempfile::tempdir().unwrap().keep();

        let agent = AgentLoop::new(
            bus,
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            Some(Arc::new(TaskRegistry::new(data_dir).await.unwrap())),
        )
        .await
        .unwrap();

        // Simulate a subagent result message
        let msg = InboundMessage::new(
            "system",
            "subagent",
            "telegram:chat_42",
            "## Subagent Result\n**Task**: test\n\nDone!",
        );

        let response = agent.process_system_message(&msg).await.unwrap();

        // Response should be routed to the original channel/chat
        assert_eq!(response.channel, "telegram");
        assert_eq!(response.chat_id, "chat_42");
        assert_eq!(response.content, "Here's a summary of the result.");
    }

    #[tokio::test]
    async fn test_process_system_message_invalid_format() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider).await;

        // Missing colon separator
        let msg = InboundMessage::new("system", "subagent", "invalid_chat_id", "test");

        let result = agent.process_system_message(&msg).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_subagent_manager_accessible() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider).await;

        // Subagent manager should start with 0 tasks
        assert_eq!(agent.subagent_manager.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_status_stream_brackets_tool_calls() {
        let tool_call = ToolCall::new("call_1", "list_dir", r#"{"path": "."}"#);
        let responses = vec![
            LlmResponse {
                content: None,
                tool_calls: vec![tool_call],
                ..Default::default()
            },
            LlmResponse {
                content: Some("done".into()),
                ..Default::default()
            },
        ];
        let provider = Arc::new(MockProvider::new(responses));
        let agent = create_test_loop(provider).await;

        agent
            .process_direct("list the directory", "cli:direct", "cli", "direct", None)
            .await
            .unwrap();

        let first = agent.bus.consume_status().await.unwrap();
        assert_eq!(first.line, kyber_core::bus::types::STATUS_START);
        let intro = agent.bus.consume_status().await.unwrap();
        assert!(intro.line.starts_with("Working on:"));
        let tool_line = agent.bus.consume_status().await.unwrap();
        assert!(tool_line.line.contains("list_dir"));
        let last = agent.bus.consume_status().await.unwrap();
        assert_eq!(last.line, kyber_core::bus::types::STATUS_END);
    }

    #[tokio::test]
    async fn test_process_direct_no_tool_calls_emits_no_status() {
        let provider = Arc::new(MockProvider::simple("just chatting"));
        let agent = create_test_loop(provider).await;

        agent
            .process_direct("hi there", "cli:direct", "cli", "direct", None)
            .await
            .unwrap();

        // Nothing was published on the status bus.
        let result = tokio::time::timeout(Duration::from_millis(50), agent.bus.consume_status()).await;
        assert!(result.is_err(), "expected no status updates to be queued");
    }

    #[tokio::test]
    async fn test_process_direct_with_tracked_task_id_does_not_auto_finalize() {
        let tool_call = ToolCall::new("call_1", "list_dir", r#"{"path": "."}"#);
        let responses = vec![
            LlmResponse {
                content: None,
                tool_calls: vec![tool_call],
                ..Default::default()
            },
            LlmResponse {
                content: Some("done".into()),
                ..Default::default()
            },
        ];
        let provider = Arc::new(MockProvider::new(responses));
        let agent = create_test_loop(provider).await;

        let task = agent
            .task_registry
            .create("delegated work", "delegated", "dashboard", "session_1")
            .await;
        agent.task_registry.mark_started(&task.id).await;

        let result = agent
            .process_direct(
                "do the delegated work",
                "dashboard:session_1",
                "dashboard",
                "session_1",
                Some(task.id.clone()),
            )
            .await
            .unwrap();
        assert_eq!(result, "done");

        // The task was not auto-finalized — it's still running, with
        // progress recorded against it by the turn.
        let got = agent.task_registry.get(&task.id).await.unwrap();
        assert_eq!(got.status, crate::task_registry::TaskStatus::Running);
        assert!(!got.actions_completed.is_empty());
    }

    /// A provider that sleeps before answering a message starting with
    /// "slow:", so a test can force one turn to still be in flight while a
    /// second turn for the same session starts.
    struct SlowFirstProvider;

    #[async_trait]
    impl LlmProvider for SlowFirstProvider {
        async fn chat(
            &self,
            messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> LlmResponse {
            let last_user = messages
                .iter()
                .filter_map(|m| match m {
                    Message::User { content: kyber_core::types::MessageContent::Text(t), .. } => Some(t.as_str()),
                    _ => None,
                })
                .last()
                .unwrap_or("");

            let reply = if last_user.starts_with("slow:") {
                tokio::time::sleep(Duration::from_millis(80)).await;
                "slow-reply"
            } else {
                "fast-reply"
            };

            LlmResponse {
                content: Some(reply.into()),
                ..Default::default()
            }
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn display_name(&self) -> &str {
            "SlowFirstProvider"
        }
    }

    #[tokio::test]
    async fn test_concurrent_turns_do_not_interleave_session_appends() {
        let agent = Arc::new(create_test_loop(Arc::new(SlowFirstProvider)).await);

        let slow = {
            let agent = agent.clone();
            tokio::spawn(async move {
                agent
                    .process_direct("slow: first turn", "cli:shared", "cli", "shared", None)
                    .await
                    .unwrap()
            })
        };
        // Give the slow turn a head start so it acquires the session lock first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fast = {
            let agent = agent.clone();
            tokio::spawn(async move {
                agent
                    .process_direct("second turn", "cli:shared", "cli", "shared", None)
                    .await
                    .unwrap()
            })
        };

        let (slow_result, fast_result) = tokio::join!(slow, fast);
        assert_eq!(slow_result.unwrap(), "slow-reply");
        assert_eq!(fast_result.unwrap(), "fast-reply");

        let history = agent.sessions().get_history("cli:shared", 50).await;
        assert_eq!(history.len(), 4);
        // The lock held across each turn guarantees the first turn's
        // user/assistant pair lands before the second turn's, even though
        // the second turn's LLM call finished first.
        assert!(matches!(&history[0], Message::User { content: kyber_core::types::MessageContent::Text(t), .. } if t == "slow: first turn"));
        assert!(matches!(&history[1], Message::Assistant { content: Some(t), .. } if t == "slow-reply"));
        assert!(matches!(&history[2], Message::User { content: kyber_core::types::MessageContent::Text(t), .. } if t == "second turn"));
        assert!(matches!(&history[3], Message::Assistant { content: Some(t), .. } if t == "fast-reply"));
    }

    #[tokio::test]
    async fn test_cancel_task_returns_false_without_handle() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider).await;
        assert!(!agent.cancel_task("nonexistent").await);
    }

    #[tokio::test]
    async fn test_cancel_task_marks_registry_cancelled() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider).await;

        let task = agent.task_registry.create("x", "x", "cli", "direct").await;
        agent.task_registry.mark_started(&task.id).await;

        // Register a fake still-running handle directly (as `adopt_handle`
        // would from a real in-flight turn).
        let jh = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        agent
            .running_handles
            .write()
            .await
            .insert(task.id.clone(), jh.abort_handle());

        assert!(agent.cancel_task(&task.id).await);
        let got = agent.task_registry.get(&task.id).await.unwrap();
        assert_eq!(got.status, crate::task_registry::TaskStatus::Cancelled);

        // Second cancel is a no-op — the handle was already removed.
        assert!(!agent.cancel_task(&task.id).await);
    }

    #[test]
    fn test_arg_preview_truncates_long_args() {
        let long_args = format!(r#"{{"path": "{}"}}"#, "x".repeat(200));
        let preview = arg_preview(&long_args);
        assert!(preview.chars().count() <= 81);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn test_arg_preview_keeps_short_args() {
        assert_eq!(arg_preview(r#"{"path": "foo"}"#), r#"{"path": "foo"}"#);
    }

    #[test]
    fn test_truncate_for_status() {
        assert_eq!(truncate_for_status("short"), "short");
        let long = "a".repeat(200);
        let truncated = truncate_for_status(&long);
        assert!(truncated.chars().count() <= 121);
        assert!(truncated.ends_with('…'));
    }
}

//! Shared test fixtures for the GatewayAPI's own unit/integration tests.
//!
//! Not compiled outside `#[cfg(test)]` — mirrors the `MockProvider` shape
//! used by `kyber-agent`'s own `agent_loop` tests, duplicated here since
//! that type isn't exported across the crate boundary.

#![cfg(test)]

use std::sync::Arc;

use async_trait::async_trait;
use kyber_agent::{AgentLoop, ExecToolConfig, TaskRegistry};
use kyber_core::bus::queue::MessageBus;
use kyber_core::types::{LlmResponse, Message, ToolDefinition};
use kyber_providers::traits::{LlmProvider, LlmRequestConfig};
use tokio::sync::Mutex as AsyncMutex;

use crate::errors::ErrorRingBuffer;
use crate::state::AppState;

/// A mock LLM provider that echoes the last user message, unless seeded
/// with specific canned responses.
pub struct MockProvider {
    responses: AsyncMutex<Vec<LlmResponse>>,
}

impl MockProvider {
    pub fn simple(text: &str) -> Self {
        Self {
            responses: AsyncMutex::new(vec![LlmResponse {
                content: Some(text.into()),
                ..Default::default()
            }]),
        }
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
        let mut responses = self.responses.lock().await;
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

/// Build a real `AgentLoop` wired to a `MockProvider`, rooted in fresh
/// temp directories.
pub async fn test_agent_loop(response: &str) -> Arc<AgentLoop> {
    let bus = Arc::new(MessageBus::new(32));
    let workspace = tempfile::tempdir().unwrap().keep();
    let data_dir = tempfile::tempdir().unwrap().keep();
    let provider: Arc<dyn LlmProvider> = Arc::new(MockProvider::simple(response));

    let agent = AgentLoop::new(
        bus,
        provider,
        workspace,
        None,
        Some(5),
        None,
        None,
        Some(ExecToolConfig::default()),
        false,
        None,
        None,
        Some(Arc::new(TaskRegistry::new(data_dir).await.unwrap())),
    )
    .await
    .unwrap();

    Arc::new(agent)
}

/// Build an `AppState` around a fresh `test_agent_loop`, with a fixed
/// bearer token for tests to authenticate with.
pub async fn test_app_state() -> Arc<AppState> {
    test_app_state_with_response("ok").await
}

pub async fn test_app_state_with_response(response: &str) -> Arc<AppState> {
    let agent = test_agent_loop(response).await;
    let error_log = Arc::new(ErrorRingBuffer::new(1000));
    Arc::new(AppState::new(agent, "test-token".to_string(), error_log))
}

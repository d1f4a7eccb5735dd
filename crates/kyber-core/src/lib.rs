//! Kyber Core — bus, session persistence, config, and shared types.
//!
//! This crate contains:
//! - **bus**: the async message bus connecting channels to the agent core
//! - **session**: conversation history persistence (JSONL, atomic writes)
//! - **config**: typed configuration schema, loading, and env var overrides
//! - **types**: OpenAI-format chat messages and shared value types
//! - **utils**: path resolution and string helpers
//! - **heartbeat**: periodic liveness ping to a configured channel
//! - **dispatch**: retrying outbound delivery with backoff and jitter

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod heartbeat;
pub mod session;
pub mod types;
pub mod utils;

pub use bus::queue::MessageBus;
pub use config::Config;
pub use dispatch::{DeliveryError, OutboundDispatcher};
pub use session::SessionManager;

//! Async message bus — inbound/outbound/status queues plus subscriptions.

pub mod queue;
pub mod types;

pub use queue::{MessageBus, OutboundCallback, StatusCallback};
pub use types::{InboundMessage, OutboundMessage, StatusUpdate, STATUS_END, STATUS_START};

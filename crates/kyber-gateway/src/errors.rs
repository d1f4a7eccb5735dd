//! Bounded in-memory error log, fed by a `tracing_subscriber::Layer`.
//!
//! The Rust-idiomatic analog of the original project's bespoke
//! `logging.error_store` module: rather than a parallel ad hoc error list,
//! this rides directly on the `tracing` infrastructure already used
//! throughout the agent loop, channel manager, and session manager.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Default cap on the number of buffered error records.
pub const DEFAULT_CAPACITY: usize = 1000;

/// A single captured `ERROR`-level event.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub target: String,
    pub message: String,
}

/// Bounded FIFO ring buffer of `ErrorRecord`s, oldest evicted first.
pub struct ErrorRingBuffer {
    capacity: usize,
    records: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    fn push(&self, record: ErrorRecord) {
        let mut records = self.records.lock().unwrap();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Up to `limit` most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let records = self.records.lock().unwrap();
        records.iter().rev().take(limit).cloned().collect()
    }

    /// Drop all buffered records.
    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

/// A `tracing_subscriber::Layer` that appends every `ERROR`-level event to
/// an `ErrorRingBuffer`.
pub struct ErrorCaptureLayer {
    buffer: std::sync::Arc<ErrorRingBuffer>,
}

impl ErrorCaptureLayer {
    pub fn new(buffer: std::sync::Arc<ErrorRingBuffer>) -> Self {
        Self { buffer }
    }
}

/// Extracts the `message` field (tracing's implicit display field) from an event.
#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for ErrorCaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != tracing::Level::ERROR {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.buffer.push(ErrorRecord {
            timestamp: kyber_core::utils::timestamp(),
            target: event.metadata().target().to_string(),
            message: visitor.0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest_beyond_capacity() {
        let buf = ErrorRingBuffer::new(2);
        buf.push(ErrorRecord { timestamp: "1".into(), target: "a".into(), message: "first".into() });
        buf.push(ErrorRecord { timestamp: "2".into(), target: "a".into(), message: "second".into() });
        buf.push(ErrorRecord { timestamp: "3".into(), target: "a".into(), message: "third".into() });

        let recent = buf.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "third");
        assert_eq!(recent[1].message, "second");
    }

    #[test]
    fn test_recent_respects_limit() {
        let buf = ErrorRingBuffer::new(10);
        for i in 0..5 {
            buf.push(ErrorRecord { timestamp: i.to_string(), target: "a".into(), message: i.to_string() });
        }
        assert_eq!(buf.recent(2).len(), 2);
    }

    #[test]
    fn test_clear_empties_buffer() {
        let buf = ErrorRingBuffer::new(10);
        buf.push(ErrorRecord { timestamp: "1".into(), target: "a".into(), message: "x".into() });
        buf.clear();
        assert!(buf.recent(10).is_empty());
    }

    #[test]
    fn test_layer_captures_error_events_only() {
        use tracing_subscriber::prelude::*;

        let buffer = std::sync::Arc::new(ErrorRingBuffer::new(10));
        let layer = ErrorCaptureLayer::new(buffer.clone());
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("this is fine");
            tracing::error!("boom: {}", "disk full");
        });

        let recent = buffer.recent(10);
        assert_eq!(recent.len(), 1);
        assert!(recent[0].message.contains("boom"));
    }
}

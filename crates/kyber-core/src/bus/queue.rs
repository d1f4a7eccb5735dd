//! Async message bus — the central nervous system of Kyber.
//!
//! Three unbounded FIFO queues (inbound, outbound, status) connect channels
//! to the agent core. The bus has no durability: anything in flight at
//! shutdown is lost. Durability is provided elsewhere (the task registry's
//! history log, the outbound dispatcher's retry queue).

use super::types::{InboundMessage, OutboundMessage, StatusUpdate};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Async callback invoked when a status line is dispatched for a channel.
pub type StatusCallback =
    Arc<dyn Fn(StatusUpdate) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Async callback invoked when an outbound message is dispatched for a channel.
pub type OutboundCallback =
    Arc<dyn Fn(OutboundMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// The message bus connecting channels ↔ agent core.
///
/// - Channels publish to `inbound` (user messages arriving)
/// - The agent core consumes from `inbound`, processes, publishes to `outbound`
/// - The outbound dispatcher consumes from `outbound` and routes to the right channel
/// - The agent core publishes progress to `status`; channels subscribe to render it
pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,
    status_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StatusUpdate>>,
    status_subscribers: RwLock<HashMap<String, Vec<StatusCallback>>>,
    outbound_subscribers: RwLock<HashMap<String, Vec<OutboundCallback>>>,
}

impl MessageBus {
    /// Create a new message bus.
    ///
    /// `_buffer_size` is kept for call-site compatibility with earlier bounded
    /// queues; the queues themselves are unbounded per the bus's durability
    /// contract (no backpressure, no durability — see module docs).
    pub fn new(_buffer_size: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        MessageBus {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            status_tx,
            status_rx: tokio::sync::Mutex::new(status_rx),
            status_subscribers: RwLock::new(HashMap::new()),
            outbound_subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Publish a message from a channel to the agent (inbound).
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<(), mpsc::error::SendError<InboundMessage>> {
        self.inbound_tx.send(msg)
    }

    /// Consume the next inbound message (blocks until available).
    /// Returns None if all senders are dropped.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }

    /// Publish a response from the agent to a channel (outbound).
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.outbound_tx.send(msg)
    }

    /// Consume the next outbound message (blocks until available).
    /// Returns None if all senders are dropped.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        rx.recv().await
    }

    /// Publish a status line.
    pub async fn publish_status(&self, update: StatusUpdate) -> Result<(), mpsc::error::SendError<StatusUpdate>> {
        self.status_tx.send(update)
    }

    /// Consume the next status update (blocks until available).
    pub async fn consume_status(&self) -> Option<StatusUpdate> {
        let mut rx = self.status_rx.lock().await;
        rx.recv().await
    }

    /// Register a callback invoked whenever a status line for `channel` is drained.
    pub async fn subscribe_status(&self, channel: impl Into<String>, cb: StatusCallback) {
        let mut subs = self.status_subscribers.write().await;
        subs.entry(channel.into()).or_default().push(cb);
    }

    /// Register a callback invoked whenever an outbound message for `channel` is drained.
    pub async fn subscribe_outbound(&self, channel: impl Into<String>, cb: OutboundCallback) {
        let mut subs = self.outbound_subscribers.write().await;
        subs.entry(channel.into()).or_default().push(cb);
    }

    /// Long-running loop that drains `status` and invokes subscribers for the
    /// matching channel. There is exactly one logical consumer of this queue;
    /// callers typically `tokio::spawn` this alongside `dispatch_outbound`.
    pub async fn dispatch_status(&self) {
        loop {
            let update = match self.consume_status().await {
                Some(u) => u,
                None => return,
            };
            let subs = self.status_subscribers.read().await;
            if let Some(callbacks) = subs.get(&update.channel) {
                for cb in callbacks {
                    cb(update.clone()).await;
                }
            }
        }
    }

    /// Invoke the outbound subscribers registered for `msg.channel`, if any.
    ///
    /// Exposed so an external dispatcher (e.g. the retry-aware
    /// `OutboundDispatcher`) can reuse the subscription table without owning
    /// the drain loop itself.
    pub async fn notify_outbound_subscribers(&self, msg: &OutboundMessage) {
        let subs = self.outbound_subscribers.read().await;
        if let Some(callbacks) = subs.get(&msg.channel) {
            for cb in callbacks {
                cb(msg.clone()).await;
            }
        }
    }

    /// Get a clone of the inbound sender (for channels to use).
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Get a clone of the outbound sender (for the agent core to use).
    pub fn outbound_sender(&self) -> mpsc::UnboundedSender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    /// Get a clone of the status sender (for the agent core to use).
    pub fn status_sender(&self) -> mpsc::UnboundedSender<StatusUpdate> {
        self.status_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inbound_message_flow() {
        let bus = MessageBus::new(10);

        let msg = InboundMessage::new("telegram", "user_1", "chat_1", "Hello!");
        bus.publish_inbound(msg).await.unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.channel, "telegram");
        assert_eq!(received.content, "Hello!");
    }

    #[tokio::test]
    async fn test_outbound_message_flow() {
        let bus = MessageBus::new(10);

        let msg = OutboundMessage::new("discord", "channel_42", "Response here");
        bus.publish_outbound(msg).await.unwrap();

        let received = bus.consume_outbound().await.unwrap();
        assert_eq!(received.channel, "discord");
        assert_eq!(received.content, "Response here");
    }

    #[tokio::test]
    async fn test_message_ordering() {
        let bus = MessageBus::new(10);

        for i in 1..=3 {
            let msg = InboundMessage::new("cli", "local", "default", format!("msg-{}", i));
            bus.publish_inbound(msg).await.unwrap();
        }

        let m1 = bus.consume_inbound().await.unwrap();
        let m2 = bus.consume_inbound().await.unwrap();
        let m3 = bus.consume_inbound().await.unwrap();

        assert_eq!(m1.content, "msg-1");
        assert_eq!(m2.content, "msg-2");
        assert_eq!(m3.content, "msg-3");
    }

    #[tokio::test]
    async fn test_sender_clone_works() {
        let bus = MessageBus::new(10);
        let sender = bus.inbound_sender();

        let msg = InboundMessage::new("slack", "user_x", "channel_y", "From clone");
        sender.send(msg).unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.channel, "slack");
        assert_eq!(received.content, "From clone");
    }

    #[tokio::test]
    async fn test_multiple_producers() {
        let bus = std::sync::Arc::new(MessageBus::new(10));

        let bus1 = bus.clone();
        let bus2 = bus.clone();

        let h1 = tokio::spawn(async move {
            let msg = InboundMessage::new("telegram", "u1", "c1", "from telegram");
            bus1.publish_inbound(msg).await.unwrap();
        });

        let h2 = tokio::spawn(async move {
            let msg = InboundMessage::new("discord", "u2", "c2", "from discord");
            bus2.publish_inbound(msg).await.unwrap();
        });

        h1.await.unwrap();
        h2.await.unwrap();

        let r1 = bus.consume_inbound().await.unwrap();
        let r2 = bus.consume_inbound().await.unwrap();

        let channels: Vec<&str> = vec![r1.channel.as_str(), r2.channel.as_str()];
        assert!(channels.contains(&"telegram"));
        assert!(channels.contains(&"discord"));
    }

    #[tokio::test]
    async fn test_full_round_trip() {
        let bus = std::sync::Arc::new(MessageBus::new(10));

        let inbound = InboundMessage::new("telegram", "user_42", "chat_99", "What is 2+2?");
        bus.publish_inbound(inbound).await.unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.content, "What is 2+2?");

        let response = OutboundMessage::new(
            received.channel.clone(),
            received.chat_id.clone(),
            "The answer is 4.",
        );
        bus.publish_outbound(response).await.unwrap();

        let outbound = bus.consume_outbound().await.unwrap();
        assert_eq!(outbound.channel, "telegram");
        assert_eq!(outbound.chat_id, "chat_99");
        assert_eq!(outbound.content, "The answer is 4.");
    }

    #[tokio::test]
    async fn test_status_queue_flow() {
        let bus = MessageBus::new(10);
        bus.publish_status(StatusUpdate::start("telegram", "c1", "k1"))
            .await
            .unwrap();
        let received = bus.consume_status().await.unwrap();
        assert_eq!(received.status_key, "k1");
    }

    #[tokio::test]
    async fn test_status_subscription_invoked() {
        let bus = std::sync::Arc::new(MessageBus::new(10));
        let seen: Arc<tokio::sync::Mutex<Vec<String>>> = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        bus.subscribe_status(
            "telegram",
            Arc::new(move |update| {
                let seen = seen_clone.clone();
                Box::pin(async move {
                    seen.lock().await.push(update.line);
                })
            }),
        )
        .await;

        bus.publish_status(StatusUpdate::start("telegram", "c1", "k1"))
            .await
            .unwrap();

        let dispatch_bus = bus.clone();
        let handle = tokio::spawn(async move {
            dispatch_bus.dispatch_status().await;
        });

        // Give the spawned dispatcher a moment to drain the single update.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.abort();

        assert_eq!(seen.lock().await.as_slice(), ["__KYBER_STATUS_START__"]);
    }
}

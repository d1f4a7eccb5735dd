//! Outbound dispatcher — retrying delivery with exponential backoff and jitter.
//!
//! Generalizes the naive "consume outbound, look up channel, send once" loop
//! into a durable-ish retry queue: a `Temporary` failure is rescheduled with
//! backoff, a `Permanent` one is dropped and logged. The dispatcher never
//! terminates on an internal error — a panic-free send path matters more
//! here than anywhere else in the process, since it's the last leg between
//! the agent and the user actually seeing a reply.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::bus::queue::MessageBus;
use crate::bus::types::OutboundMessage;

/// Why an outbound delivery failed.
///
/// A closed two-variant enum rather than a generic error type: every send
/// call site is forced to classify its failure, which is the whole point —
/// an unclassified failure defaults to `Temporary` (safe: worst case is a
/// redundant retry) only at the one boundary (`impl From<anyhow::Error>`)
/// where a channel hasn't been updated to classify explicitly yet.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DeliveryError {
    /// Transient failure (network blip, rate limit, reconnect in progress).
    /// Safe to retry.
    #[error("temporary delivery failure: {0}")]
    Temporary(String),
    /// Failure that retrying will not fix (bad chat id, missing permissions,
    /// channel not registered). Dropped without retry.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl From<anyhow::Error> for DeliveryError {
    fn from(e: anyhow::Error) -> Self {
        DeliveryError::Temporary(e.to_string())
    }
}

/// A send function: given an outbound message, attempt delivery once.
///
/// Implemented by the channel layer (`ChannelManager` wraps its registered
/// channels' `send()` methods behind this) so that `kyber-core` — which sits
/// below `kyber-channels` in the dependency graph — never needs to know
/// about the `Channel` trait itself.
pub type SendFn = Arc<
    dyn Fn(OutboundMessage) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send>>
        + Send
        + Sync,
>;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const PER_SEND_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_POLL: Duration = Duration::from_millis(500);

struct RetryRecord {
    due_at: Instant,
    attempt: u32,
    msg: OutboundMessage,
}

// `BinaryHeap` is a max-heap; reverse the ordering on `due_at` so the
// earliest-due retry pops first.
impl PartialEq for RetryRecord {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at
    }
}
impl Eq for RetryRecord {}
impl PartialOrd for RetryRecord {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for RetryRecord {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.due_at.cmp(&self.due_at)
    }
}

/// Computes the next backoff delay for a given attempt count, with jitter.
///
/// Exponential: `BASE_BACKOFF * 2^(attempt - 1)`, capped at `MAX_BACKOFF`,
/// then scaled by a uniform random factor in `[0.8, 1.2)` so that a burst of
/// simultaneously-failing sends doesn't retry in lockstep.
fn backoff_for(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(1u32 << attempt.min(8));
    let capped = exp.min(MAX_BACKOFF);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    capped.mul_f64(jitter)
}

/// Retrying outbound dispatcher.
///
/// Owns no channels directly — it consumes `OutboundMessage`s from the bus
/// and hands each to `send_fn`, rescheduling `Temporary` failures with
/// backoff and dropping `Permanent` ones.
pub struct OutboundDispatcher {
    bus: Arc<MessageBus>,
    send_fn: SendFn,
    retry_queue: Mutex<BinaryHeap<RetryRecord>>,
}

impl OutboundDispatcher {
    pub fn new(bus: Arc<MessageBus>, send_fn: SendFn) -> Self {
        OutboundDispatcher {
            bus,
            send_fn,
            retry_queue: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Run the dispatch loop. Never returns under normal operation; exits
    /// only once the bus's outbound sender side is fully dropped.
    pub async fn run(&self) {
        loop {
            let next_retry_at = {
                let queue = self.retry_queue.lock().await;
                queue.peek().map(|r| r.due_at)
            };

            let sleep_for = match next_retry_at {
                Some(at) => at.saturating_duration_since(Instant::now()),
                None => IDLE_POLL,
            };

            tokio::select! {
                msg = self.bus.consume_outbound() => {
                    match msg {
                        Some(m) => self.attempt_send(m, 0).await,
                        None => {
                            debug!("outbound bus closed, dispatcher exiting");
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {
                    self.drain_due_retries().await;
                }
            }
        }
    }

    async fn drain_due_retries(&self) {
        let due: Vec<RetryRecord> = {
            let mut queue = self.retry_queue.lock().await;
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(top) = queue.peek() {
                if top.due_at <= now {
                    due.push(queue.pop().unwrap());
                } else {
                    break;
                }
            }
            due
        };

        for record in due {
            self.attempt_send(record.msg, record.attempt).await;
        }
    }

    async fn attempt_send(&self, msg: OutboundMessage, attempt: u32) {
        let result = tokio::time::timeout(PER_SEND_TIMEOUT, (self.send_fn)(msg.clone())).await;

        match result {
            Ok(Ok(())) => {
                self.bus.notify_outbound_subscribers(&msg).await;
            }
            Ok(Err(DeliveryError::Permanent(reason))) => {
                error!(
                    channel = %msg.channel,
                    chat_id = %msg.chat_id,
                    reason = %reason,
                    "dropping outbound message, permanent delivery failure"
                );
            }
            Ok(Err(DeliveryError::Temporary(reason))) => {
                self.reschedule(msg, attempt, reason).await;
            }
            Err(_elapsed) => {
                self.reschedule(msg, attempt, format!("send timed out after {PER_SEND_TIMEOUT:?}")).await;
            }
        }
    }

    async fn reschedule(&self, msg: OutboundMessage, attempt: u32, reason: String) {
        let next_attempt = attempt + 1;
        let delay = backoff_for(next_attempt);
        warn!(
            channel = %msg.channel,
            chat_id = %msg.chat_id,
            attempt = next_attempt,
            delay = ?delay,
            reason = %reason,
            "temporary delivery failure, retrying"
        );

        let mut queue = self.retry_queue.lock().await;
        queue.push(RetryRecord {
            due_at: Instant::now() + delay,
            attempt: next_attempt,
            msg,
        });
    }

    /// Number of sends currently waiting for their retry to come due.
    /// Exposed for tests and for the gateway's `/health` diagnostics.
    pub async fn pending_retries(&self) -> usize {
        self.retry_queue.lock().await.len()
    }
}

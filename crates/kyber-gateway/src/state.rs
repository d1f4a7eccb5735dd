//! `AppState` — shared state handed to every axum handler behind an `Arc`.
//!
//! Grounded on `skynet-gateway`'s own `AppState` (a plain struct of the
//! subsystems a handler might need, constructed once at startup and never
//! mutated itself — interior mutability lives in the fields that need it).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use kyber_agent::AgentLoop;

use crate::errors::ErrorRingBuffer;

/// Shared state for the GatewayAPI router.
pub struct AppState {
    /// The running agent, for task lookups, `process_direct`, and `cancel_task`.
    pub agent: Arc<AgentLoop>,
    /// Bearer token required on every route except `/health`.
    pub auth_token: String,
    /// Ring buffer of recent `ERROR`-level log events, for `/errors`.
    pub error_log: Arc<ErrorRingBuffer>,
    /// Per-`dashboard:<session_id>` locks serializing `/chat/turn` calls.
    /// Lazily created, mirroring `SessionManager`'s own per-key lock map.
    chat_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppState {
    pub fn new(agent: Arc<AgentLoop>, auth_token: String, error_log: Arc<ErrorRingBuffer>) -> Self {
        Self {
            agent,
            auth_token,
            error_log,
            chat_locks: RwLock::new(HashMap::new()),
        }
    }

    /// Get (creating if absent) the mutex serializing `/chat/turn` calls for
    /// `session_key`.
    pub async fn lock_for(&self, session_key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.chat_locks.read().await.get(session_key) {
            return lock.clone();
        }
        let mut locks = self.chat_locks.write().await;
        locks
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-session lock for `session_key`, if any. Called by
    /// `/chat/reset` — a held `Arc` in an in-flight `/chat/turn` keeps
    /// working fine; this just stops the map from growing unbounded across
    /// resets of abandoned sessions.
    pub async fn drop_lock(&self, session_key: &str) {
        self.chat_locks.write().await.remove(session_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_app_state;

    #[tokio::test]
    async fn test_lock_for_returns_same_instance_for_same_key() {
        let state = test_app_state().await;
        let a = state.lock_for("dashboard:x").await;
        let b = state.lock_for("dashboard:x").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_lock_for_distinct_keys_are_independent() {
        let state = test_app_state().await;
        let a = state.lock_for("dashboard:x").await;
        let b = state.lock_for("dashboard:y").await;
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_drop_lock_removes_entry() {
        let state = test_app_state().await;
        let a = state.lock_for("dashboard:x").await;
        state.drop_lock("dashboard:x").await;
        let b = state.lock_for("dashboard:x").await;
        assert!(!Arc::ptr_eq(&a, &b));
    }
}

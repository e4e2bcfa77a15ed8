//! Registry of per-session streaming turns.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::state::{SessionStreamingContext, StreamingState};
use crate::approval::ApprovalWaitObserver;

/// Mutable state of one session's turn. Guarded by a per-session mutex.
#[derive(Debug, Default)]
pub struct TurnShared {
    pub context: SessionStreamingContext,
    /// Accumulated assistant text.
    pub content: String,
    /// A consumer is attached to this turn.
    pub active: bool,
}

pub type TurnHandle = Arc<Mutex<TurnShared>>;

/// Streaming contexts keyed by session id.
#[derive(Default)]
pub struct StreamingRegistry {
    sessions: RwLock<HashMap<String, TurnHandle>>,
}

impl StreamingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the session's context for a new turn. `None` when a turn is
    /// still active.
    pub async fn begin_turn(&self, session_id: &str) -> Option<TurnHandle> {
        let handle = {
            let mut sessions = self.sessions.write().await;
            Arc::clone(sessions.entry(session_id.to_string()).or_default())
        };
        {
            let mut turn = handle.lock().await;
            if turn.active {
                return None;
            }
            *turn = TurnShared {
                active: true,
                ..TurnShared::default()
            };
        }
        Some(handle)
    }

    pub async fn get(&self, session_id: &str) -> Option<TurnHandle> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Snapshot of a session's streaming context.
    pub async fn context(&self, session_id: &str) -> Option<SessionStreamingContext> {
        let handle = self.get(session_id).await?;
        let turn = handle.lock().await;
        Some(turn.context.clone())
    }

    pub async fn state(&self, session_id: &str) -> Option<StreamingState> {
        self.context(session_id).await.map(|c| c.state)
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            debug!(session_id, "Removed streaming context");
        }
        removed
    }
}

#[async_trait]
impl ApprovalWaitObserver for StreamingRegistry {
    async fn approval_wait_started(&self, session_id: &str) {
        if let Some(handle) = self.get(session_id).await {
            handle.lock().await.context.enter_approval_wait();
        }
    }

    async fn approval_wait_finished(&self, session_id: &str) {
        if let Some(handle) = self.get(session_id).await {
            handle.lock().await.context.exit_approval_wait();
        }
    }
}

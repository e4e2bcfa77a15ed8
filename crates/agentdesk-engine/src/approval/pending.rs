//! Pending approval tracker.
//!
//! Holds the responder for every prompt awaiting a human decision, keyed by
//! request id.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, oneshot};
use tracing::{debug, warn};

use super::{ApprovalRequest, ApprovalResponse, reasons};

/// A prompt awaiting a decision.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub request_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub description: String,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl PendingApproval {
    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

struct PendingEntry {
    info: PendingApproval,
    responder: oneshot::Sender<ApprovalResponse>,
}

/// Registry of pending approvals.
#[derive(Default)]
pub struct PendingApprovals {
    entries: RwLock<HashMap<String, PendingEntry>>,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prompt. The receiver yields the decision, or an error if the
    /// entry is dropped (expired, cleared) without one.
    pub async fn create(
        &self,
        request: &ApprovalRequest,
        timeout: Duration,
    ) -> (PendingApproval, oneshot::Receiver<ApprovalResponse>) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let info = PendingApproval {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: request.session_id.clone(),
            tool_name: request.tool_name.clone(),
            description: request.description.clone(),
            created_at: now,
            expires_at: now + timeout,
        };
        self.entries.write().await.insert(
            info.request_id.clone(),
            PendingEntry {
                info: info.clone(),
                responder: tx,
            },
        );
        debug!(request_id = %info.request_id, session_id = %info.session_id, "Added pending approval");
        (info, rx)
    }

    /// Deliver a decision. Returns `false` if the request is unknown or its
    /// waiter already gave up.
    pub async fn resolve(&self, request_id: &str, response: ApprovalResponse) -> bool {
        let Some(entry) = self.entries.write().await.remove(request_id) else {
            warn!(request_id, "Decision for unknown approval request");
            return false;
        };
        entry.responder.send(response).is_ok()
    }

    /// Forget a request without answering it.
    pub async fn take(&self, request_id: &str) -> Option<PendingApproval> {
        self.entries
            .write()
            .await
            .remove(request_id)
            .map(|entry| entry.info)
    }

    pub async fn contains(&self, request_id: &str) -> bool {
        self.entries.read().await.contains_key(request_id)
    }

    pub async fn get_for_session(&self, session_id: &str) -> Vec<PendingApproval> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.info.session_id == session_id)
            .map(|e| e.info.clone())
            .collect()
    }

    /// Deny every pending request of a session.
    pub async fn cancel_session(&self, session_id: &str) -> usize {
        let cancelled: Vec<PendingEntry> = {
            let mut entries = self.entries.write().await;
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.info.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = cancelled.len();
        for entry in cancelled {
            let _ = entry
                .responder
                .send(ApprovalResponse::deny(reasons::CANCELLED));
        }
        if count > 0 {
            debug!(session_id, count, "Cancelled pending approvals");
        }
        count
    }

    /// Drop expired requests; their waiters observe a closed channel.
    pub async fn cleanup_expired(&self) -> Vec<String> {
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.info.is_expired())
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            entries.remove(id);
            warn!(request_id = %id, "Approval request expired");
        }
        expired
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

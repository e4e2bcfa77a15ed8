//! Approval decision engine.
//!
//! Order of evaluation for [`ApprovalGate::request_approval`]:
//! 1. Auto-approved read-only tools
//! 2. Autonomous-mode switches on the session
//! 3. One-time approvals, then session rules, then global rules
//! 4. A prompt to the approval handlers, bounded by the request timeout

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use agentdesk_core::risk::{self, RiskLevel};
use agentdesk_core::rules::{ApprovalRule, RuleCollection, RuleRepository, RuleScope};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pending::{PendingApproval, PendingApprovals};
use super::{ApprovalPrompt, ApprovalRequest, ApprovalResponse, DecisionSource, reasons};
use crate::events::{CoreEvent, EventBus};
use crate::session::AutonomyFlags;

const PROMPT_CHANNEL_CAPACITY: usize = 64;

/// Tool-name fragments covered by "allow all paths".
const PATH_KEYWORDS: &[&str] = &[
    "file", "path", "dir", "folder", "read", "write", "edit", "glob", "ls",
];
/// Tool-name fragments covered by "allow all URLs".
const URL_KEYWORDS: &[&str] = &["url", "fetch", "web", "http", "browse", "download"];

/// Notified while a tool call waits for a human.
#[async_trait]
pub trait ApprovalWaitObserver: Send + Sync {
    async fn approval_wait_started(&self, session_id: &str);
    async fn approval_wait_finished(&self, session_id: &str);
}

/// Decides whether tool calls may run.
pub struct ApprovalGate {
    rules: RwLock<RuleCollection>,
    repository: Arc<dyn RuleRepository>,
    persist_lock: Mutex<()>,
    /// Session id -> `"{tool}:{args}"` keys approved for one use.
    one_time: RwLock<HashMap<String, HashSet<String>>>,
    pending: PendingApprovals,
    prompts: broadcast::Sender<ApprovalPrompt>,
    events: EventBus,
    request_timeout: Duration,
    wait_observer: Option<Arc<dyn ApprovalWaitObserver>>,
}

impl ApprovalGate {
    /// Create a gate, loading stored rules. A store that fails to load is
    /// logged and treated as empty.
    pub fn new(
        repository: Arc<dyn RuleRepository>,
        events: EventBus,
        request_timeout: Duration,
    ) -> Self {
        let rules = repository.load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load approval rules, starting empty");
            RuleCollection::default()
        });
        let (prompts, _) = broadcast::channel(PROMPT_CHANNEL_CAPACITY);
        Self {
            rules: RwLock::new(rules),
            repository,
            persist_lock: Mutex::new(()),
            one_time: RwLock::new(HashMap::new()),
            pending: PendingApprovals::new(),
            prompts,
            events,
            request_timeout,
            wait_observer: None,
        }
    }

    #[must_use]
    pub fn with_wait_observer(mut self, observer: Arc<dyn ApprovalWaitObserver>) -> Self {
        self.wait_observer = Some(observer);
        self
    }

    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Receive approval prompts. With no live receiver, prompts are denied
    /// immediately.
    pub fn subscribe_requests(&self) -> broadcast::Receiver<ApprovalPrompt> {
        self.prompts.subscribe()
    }

    /// Check one-time approvals and saved rules.
    ///
    /// A matching one-time approval is consumed. No match is `false`.
    pub async fn is_approved(
        &self,
        session_id: &str,
        tool_name: &str,
        args: &serde_json::Value,
    ) -> bool {
        self.lookup(session_id, tool_name, &args.to_string())
            .await
            .is_some_and(|(approved, _)| approved)
    }

    /// Decision from one-time approvals or rules, if any applies.
    async fn lookup(
        &self,
        session_id: &str,
        tool_name: &str,
        serialized_args: &str,
    ) -> Option<(bool, Option<String>)> {
        let key = one_time_key(tool_name, serialized_args);
        {
            let mut one_time = self.one_time.write().await;
            let consumed = one_time
                .get_mut(session_id)
                .is_some_and(|keys| keys.remove(&key));
            if consumed {
                if one_time.get(session_id).is_some_and(HashSet::is_empty) {
                    one_time.remove(session_id);
                }
                debug!(session_id, tool_name, "Consumed one-time approval");
                return Some((true, None));
            }
        }

        self.rules
            .read()
            .await
            .find_match(session_id, tool_name, serialized_args)
            .map(|rule| (rule.approved, Some(rule.id.clone())))
    }

    /// Decide a tool call. Never fails: every internal problem is a deny.
    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
        autonomy: &AutonomyFlags,
        cancel: &CancellationToken,
    ) -> ApprovalResponse {
        if risk::is_auto_approved(&request.tool_name) {
            return self.decided(
                &request,
                ApprovalResponse::allow(),
                DecisionSource::AutoApproved,
            );
        }

        if autonomy_allows(autonomy, &request.tool_name) {
            return self.decided(
                &request,
                ApprovalResponse::allow(),
                DecisionSource::Autonomous,
            );
        }

        if let Some((approved, rule_id)) = self
            .lookup(
                &request.session_id,
                &request.tool_name,
                &request.serialized_args(),
            )
            .await
        {
            debug!(session_id = %request.session_id, tool_name = %request.tool_name, ?rule_id, approved, "Rule decided");
            let response = if approved {
                ApprovalResponse::allow()
            } else {
                ApprovalResponse::deny(reasons::RULE_DENIED)
            };
            return self.decided(&request, response, DecisionSource::Rule);
        }

        self.ask_handler(request, cancel).await
    }

    async fn ask_handler(
        &self,
        request: ApprovalRequest,
        cancel: &CancellationToken,
    ) -> ApprovalResponse {
        if self.prompts.receiver_count() == 0 {
            return self.decided(
                &request,
                ApprovalResponse::deny(reasons::NO_HANDLER),
                DecisionSource::NoHandler,
            );
        }

        let (info, rx) = self.pending.create(&request, self.request_timeout).await;
        let prompt = ApprovalPrompt {
            request_id: info.request_id.clone(),
            request: request.clone(),
            expires_at: request.timestamp.saturating_add(
                i64::try_from(self.request_timeout.as_millis()).unwrap_or(i64::MAX),
            ),
        };
        if self.prompts.send(prompt).is_err() {
            self.pending.take(&info.request_id).await;
            return self.decided(
                &request,
                ApprovalResponse::deny(reasons::NO_HANDLER),
                DecisionSource::NoHandler,
            );
        }

        info!(
            session_id = %request.session_id,
            tool_name = %request.tool_name,
            request_id = %info.request_id,
            risk = %request.risk_level,
            "Waiting for approval decision"
        );
        if let Some(observer) = &self.wait_observer {
            observer.approval_wait_started(&request.session_id).await;
        }

        let (response, source) = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                (ApprovalResponse::deny(reasons::CANCELLED), DecisionSource::Cancelled)
            }
            result = tokio::time::timeout(self.request_timeout, rx) => match result {
                Ok(Ok(response)) => {
                    let source = if response.reason.as_deref() == Some(reasons::CANCELLED) {
                        DecisionSource::Cancelled
                    } else {
                        DecisionSource::User
                    };
                    (response, source)
                }
                Ok(Err(_)) => (ApprovalResponse::deny(reasons::HANDLER_GONE), DecisionSource::Timeout),
                Err(_) => {
                    warn!(request_id = %info.request_id, timeout = ?self.request_timeout, "Approval request timed out");
                    (ApprovalResponse::deny(reasons::TIMEOUT), DecisionSource::Timeout)
                }
            },
        };
        self.pending.take(&info.request_id).await;

        if let Some(observer) = &self.wait_observer {
            observer.approval_wait_finished(&request.session_id).await;
        }

        if source == DecisionSource::User && response.remember_decision {
            self.record_decision(&request, &response).await;
        }
        self.decided(&request, response, source)
    }

    /// Deliver a handler's decision for a pending prompt.
    pub async fn resolve(&self, request_id: &str, response: ApprovalResponse) -> bool {
        self.pending.resolve(request_id, response).await
    }

    /// Store a decision for future calls.
    ///
    /// An unremembered one-time approval allows the next identical call once.
    /// Everything else becomes a rule: global scope is global, other scopes
    /// are bound to the request's session.
    pub async fn record_decision(&self, request: &ApprovalRequest, response: &ApprovalResponse) {
        if response.scope == RuleScope::Once && !response.remember_decision {
            if response.approved {
                self.one_time
                    .write()
                    .await
                    .entry(request.session_id.clone())
                    .or_default()
                    .insert(one_time_key(
                        &request.tool_name,
                        &request.serialized_args(),
                    ));
            }
            return;
        }

        let rule = match response.scope {
            RuleScope::Global => {
                ApprovalRule::global(&request.tool_name, None, response.approved)
            }
            RuleScope::Session | RuleScope::Once => ApprovalRule::for_session(
                &request.session_id,
                &request.tool_name,
                None,
                response.approved,
            ),
        }
        .with_description(request.description.clone());

        if let Err(e) = self.add_rule(rule).await {
            warn!(tool_name = %request.tool_name, error = %e, "Failed to record approval rule");
        }
    }

    /// Insert or replace a rule and persist the collection.
    pub async fn add_rule(&self, rule: ApprovalRule) -> agentdesk_core::Result<()> {
        info!(
            tool_name = %rule.tool_name,
            scope = ?rule.scope,
            approved = rule.approved,
            "Saving approval rule"
        );
        self.rules.write().await.upsert(rule)?;
        self.persist().await;
        Ok(())
    }

    /// Remove a rule by id.
    pub async fn remove_rule(&self, rule_id: &str) -> Option<ApprovalRule> {
        let removed = self.rules.write().await.remove(rule_id);
        if removed.is_some() {
            self.persist().await;
        }
        removed
    }

    /// Snapshot of the current rules.
    pub async fn rules(&self) -> RuleCollection {
        self.rules.read().await.clone()
    }

    #[allow(clippy::unused_self)]
    pub fn tool_risk_level(&self, tool_name: &str) -> RiskLevel {
        risk::tool_risk_level(tool_name)
    }

    pub async fn pending_for_session(&self, session_id: &str) -> Vec<PendingApproval> {
        self.pending.get_for_session(session_id).await
    }

    /// Deny every prompt a session is waiting on.
    pub async fn cancel_pending(&self, session_id: &str) -> usize {
        self.pending.cancel_session(session_id).await
    }

    /// Sweep prompts past their expiry.
    pub async fn cleanup_expired(&self) -> usize {
        self.pending.cleanup_expired().await.len()
    }

    /// Forget everything tied to a session.
    pub async fn clear_session(&self, session_id: &str) {
        self.cancel_pending(session_id).await;
        self.one_time.write().await.remove(session_id);
        let removed = self.rules.write().await.remove_session(session_id);
        if removed > 0 {
            debug!(session_id, removed, "Dropped session approval rules");
            self.persist().await;
        }
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.rules.read().await.clone();
        let repository = Arc::clone(&self.repository);
        match tokio::task::spawn_blocking(move || repository.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to persist approval rules"),
            Err(e) => warn!(error = %e, "Approval rule persistence task failed"),
        }
    }

    fn decided(
        &self,
        request: &ApprovalRequest,
        response: ApprovalResponse,
        source: DecisionSource,
    ) -> ApprovalResponse {
        debug!(
            session_id = %request.session_id,
            tool_name = %request.tool_name,
            approved = response.approved,
            ?source,
            "Approval decided"
        );
        self.events.publish(CoreEvent::ApprovalDecided {
            session_id: request.session_id.clone(),
            tool_name: request.tool_name.clone(),
            approved: response.approved,
            source,
            reason: response.reason.clone(),
        });
        response
    }
}

fn one_time_key(tool_name: &str, serialized_args: &str) -> String {
    format!("{tool_name}:{serialized_args}")
}

/// Whether autonomous-mode switches cover this tool.
fn autonomy_allows(autonomy: &AutonomyFlags, tool_name: &str) -> bool {
    if autonomy.allow_all || autonomy.allow_all_tools {
        return true;
    }
    let lower = tool_name.to_ascii_lowercase();
    (autonomy.allow_all_paths && PATH_KEYWORDS.iter().any(|k| lower.contains(k)))
        || (autonomy.allow_all_urls && URL_KEYWORDS.iter().any(|k| lower.contains(k)))
}

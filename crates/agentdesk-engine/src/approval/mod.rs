//! Tool approval gate.
//!
//! Every tool call the agent wants to run passes through [`ApprovalGate`]
//! before the backend executes it.

mod gate;
mod pending;

pub use gate::{ApprovalGate, ApprovalWaitObserver};
pub use pending::{PendingApproval, PendingApprovals};

use std::path::PathBuf;

use agentdesk_core::RuleScope;
use agentdesk_core::risk::{self, RiskLevel};
use serde::{Deserialize, Serialize};

use crate::backend::bridge::tool_description;

/// A tool call awaiting a decision. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub session_id: String,
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub working_directory: PathBuf,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub risk_level: RiskLevel,
    pub description: String,
}

impl ApprovalRequest {
    pub fn new(
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args: serde_json::Value,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        let tool_name = tool_name.into();
        Self {
            session_id: session_id.into(),
            risk_level: risk::tool_risk_level(&tool_name),
            description: tool_description(&tool_name, &tool_args),
            tool_name,
            tool_args,
            working_directory: working_directory.into(),
            timestamp: agentdesk_core::time::unix_timestamp_ms(),
        }
    }

    /// Arguments as matched by rule patterns and one-time keys.
    pub fn serialized_args(&self) -> String {
        self.tool_args.to_string()
    }
}

/// A decision on an [`ApprovalRequest`]. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub approved: bool,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default)]
    pub reason: Option<String>,
    /// Persist the decision as a rule.
    #[serde(default)]
    pub remember_decision: bool,
}

impl ApprovalResponse {
    /// One-shot allow.
    pub fn allow() -> Self {
        Self {
            approved: true,
            scope: RuleScope::Once,
            reason: None,
            remember_decision: false,
        }
    }

    /// One-shot deny with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            scope: RuleScope::Once,
            reason: Some(reason.into()),
            remember_decision: false,
        }
    }

    /// Remember the decision in the given scope.
    #[must_use]
    pub const fn remembered(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self.remember_decision = true;
        self
    }
}

/// Prompt published to approval handlers (the UI).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPrompt {
    pub request_id: String,
    pub request: ApprovalRequest,
    /// Unix milliseconds after which the gate denies on its own.
    pub expires_at: i64,
}

/// What produced a decision, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    AutoApproved,
    Autonomous,
    Rule,
    User,
    NoHandler,
    Timeout,
    Cancelled,
}

/// Deny reasons surfaced to the agent.
pub mod reasons {
    pub const NO_HANDLER: &str = "no handler available";
    pub const TIMEOUT: &str = "approval request timed out";
    pub const CANCELLED: &str = "cancelled";
    pub const RULE_DENIED: &str = "denied by approval rule";
    pub const HANDLER_GONE: &str = "approval handler went away";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_derives_risk_and_description() {
        let request = ApprovalRequest::new(
            "s1",
            "Bash",
            serde_json::json!({"command": "cargo test"}),
            "/tmp",
        );
        assert_eq!(request.risk_level, RiskLevel::Critical);
        assert_eq!(request.description, "cargo test");
        assert_eq!(request.serialized_args(), r#"{"command":"cargo test"}"#);
    }

    #[test]
    fn remembered_sets_scope_and_flag() {
        let response = ApprovalResponse::allow().remembered(RuleScope::Global);
        assert!(response.approved);
        assert!(response.remember_decision);
        assert_eq!(response.scope, RuleScope::Global);
    }
}

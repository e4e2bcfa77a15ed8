//! Tool hooks attached to every backend session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::approval::{ApprovalGate, ApprovalRequest};
use crate::backend::{HookDecision, ToolHooks, ToolUse};
use crate::session::SharedSession;

/// Routes pre-tool-use checks into the approval gate.
pub struct GateHooks {
    gate: Arc<ApprovalGate>,
    session: SharedSession,
    /// Cancelled when the session is closed or recreated.
    shutdown: CancellationToken,
    ceiling: Duration,
}

impl GateHooks {
    pub fn new(
        gate: Arc<ApprovalGate>,
        session: SharedSession,
        shutdown: CancellationToken,
        ceiling: Duration,
    ) -> Self {
        Self {
            gate,
            session,
            shutdown,
            ceiling,
        }
    }
}

#[async_trait]
impl ToolHooks for GateHooks {
    async fn pre_tool_use(&self, tool: &ToolUse) -> HookDecision {
        let (session_id, working_directory, autonomy) = {
            let session = self.session.read().await;
            (
                session.session_id.clone(),
                session.working_directory.clone(),
                session.autonomy,
            )
        };
        let request = ApprovalRequest::new(
            session_id.clone(),
            tool.tool_name.clone(),
            tool.arguments.clone(),
            working_directory,
        );

        // Own task: a panic inside the gate surfaces as a JoinError.
        let gate = Arc::clone(&self.gate);
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(async move {
            gate.request_approval(request, &autonomy, &cancel).await
        });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.ceiling, task).await {
            Ok(Ok(response)) if response.approved => HookDecision::Allow,
            Ok(Ok(response)) => HookDecision::Deny {
                reason: response
                    .reason
                    .unwrap_or_else(|| "Denied by approval policy".to_string()),
            },
            Ok(Err(e)) => {
                error!(session_id = %session_id, tool_name = %tool.tool_name, error = %e, "Approval check failed");
                HookDecision::Deny {
                    reason: "Approval check failed".to_string(),
                }
            }
            Err(_) => {
                abort.abort();
                warn!(session_id = %session_id, tool_name = %tool.tool_name, "Approval hook exceeded its ceiling");
                HookDecision::Deny {
                    reason: "Approval check timed out".to_string(),
                }
            }
        }
    }

    async fn post_tool_use(&self, tool_call_id: &str, success: bool) {
        debug!(tool_call_id, success, "Tool finished");
    }

    async fn on_error(&self, message: &str) {
        let session_id = self.session.read().await.session_id.clone();
        warn!(session_id = %session_id, error = message, "Backend session error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::session::{AutonomyFlags, Session};
    use agentdesk_core::rules::MemoryRuleRepository;

    fn hooks(autonomy: AutonomyFlags) -> GateHooks {
        let gate = Arc::new(ApprovalGate::new(
            Arc::new(MemoryRuleRepository::new()),
            EventBus::default(),
            Duration::from_secs(5),
        ));
        GateHooks::new(
            gate,
            Session::new("s1", "/tmp").with_autonomy(autonomy).shared(),
            CancellationToken::new(),
            Duration::from_secs(10),
        )
    }

    fn tool(name: &str) -> ToolUse {
        ToolUse {
            tool_name: name.to_string(),
            arguments: serde_json::json!({"command": "ls"}),
            tool_call_id: None,
        }
    }

    #[tokio::test]
    async fn read_only_tool_is_allowed() {
        let decision = hooks(AutonomyFlags::default()).pre_tool_use(&tool("read_file")).await;
        assert_eq!(decision, HookDecision::Allow);
    }

    #[tokio::test]
    async fn no_handler_denies() {
        let decision = hooks(AutonomyFlags::default()).pre_tool_use(&tool("Bash")).await;
        assert_eq!(
            decision,
            HookDecision::Deny {
                reason: "no handler available".to_string()
            }
        );
    }

    #[tokio::test]
    async fn autonomy_is_read_from_session() {
        let decision = hooks(AutonomyFlags::full()).pre_tool_use(&tool("Bash")).await;
        assert!(decision.is_allowed());
    }
}

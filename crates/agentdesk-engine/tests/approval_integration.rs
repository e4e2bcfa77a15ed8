#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the approval gate.
//!
//! Covers rule scopes, one-time approvals, the UI handoff and persistence
//! through the JSON rule store.

use std::sync::Arc;
use std::time::Duration;

use agentdesk_core::RuleScope;
use agentdesk_core::rules::{ApprovalRule, JsonRuleRepository, MemoryRuleRepository, RuleRepository};
use agentdesk_engine::approval::{ApprovalGate, ApprovalRequest, ApprovalResponse, DecisionSource};
use agentdesk_engine::{AutonomyFlags, CoreEvent, EventBus};
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

fn gate_with(repository: Arc<dyn RuleRepository>) -> ApprovalGate {
    ApprovalGate::new(repository, EventBus::default(), Duration::from_secs(5))
}

fn gate() -> ApprovalGate {
    gate_with(Arc::new(MemoryRuleRepository::new()))
}

fn bash(session_id: &str, command: &str) -> ApprovalRequest {
    ApprovalRequest::new(session_id, "Bash", json!({ "command": command }), "/tmp")
}

#[tokio::test]
async fn global_approval_applies_to_every_session() {
    let gate = gate();
    gate.add_rule(ApprovalRule::global("Bash", None, true))
        .await
        .unwrap();

    for session in ["s1", "s2", "another-session"] {
        assert!(gate.is_approved(session, "Bash", &json!({"command": "ls"})).await);
    }
    assert!(!gate.is_approved("s1", "Write", &json!({})).await);
}

#[tokio::test]
async fn session_approval_is_isolated() {
    let gate = gate();
    let request = bash("s1", "ls");
    gate.record_decision(&request, &ApprovalResponse::allow().remembered(RuleScope::Session))
        .await;

    assert!(gate.is_approved("s1", "Bash", &json!({"command": "rm -rf target"})).await);
    assert!(!gate.is_approved("s2", "Bash", &json!({"command": "ls"})).await);
}

#[tokio::test]
async fn once_approval_is_consumed_by_first_check() {
    let gate = gate();
    let request = bash("s1", "cargo test");
    gate.record_decision(&request, &ApprovalResponse::allow()).await;

    let args = json!({"command": "cargo test"});
    assert!(gate.is_approved("s1", "Bash", &args).await);
    assert!(!gate.is_approved("s1", "Bash", &args).await);
}

#[tokio::test]
async fn session_rule_beats_global_rule() {
    let gate = gate();
    gate.add_rule(ApprovalRule::global("Bash", None, true))
        .await
        .unwrap();
    gate.add_rule(ApprovalRule::for_session("s1", "Bash", None, false))
        .await
        .unwrap();

    assert!(!gate.is_approved("s1", "Bash", &json!({})).await);
    assert!(gate.is_approved("s2", "Bash", &json!({})).await);
}

#[tokio::test]
async fn no_handler_denies_without_blocking() {
    let gate = gate();
    let response = tokio::time::timeout(
        Duration::from_secs(1),
        gate.request_approval(
            bash("s1", "ls"),
            &AutonomyFlags::default(),
            &CancellationToken::new(),
        ),
    )
    .await
    .unwrap();

    assert!(!response.approved);
    assert_eq!(response.reason.as_deref(), Some("no handler available"));
}

#[tokio::test]
async fn read_file_is_allowed_without_rules_or_prompt() {
    let events = EventBus::default();
    let gate = ApprovalGate::new(
        Arc::new(MemoryRuleRepository::new()),
        events.clone(),
        Duration::from_secs(5),
    );
    // A global deny must not be consulted for auto-approved tools.
    gate.add_rule(ApprovalRule::global("read_file", None, false))
        .await
        .unwrap();
    let mut prompts = gate.subscribe_requests();
    let mut audit = events.subscribe();

    let response = gate
        .request_approval(
            ApprovalRequest::new("s1", "read_file", json!({"path": "/etc/passwd"}), "/tmp"),
            &AutonomyFlags::default(),
            &CancellationToken::new(),
        )
        .await;

    assert!(response.approved);
    assert!(matches!(prompts.try_recv(), Err(TryRecvError::Empty)));
    match audit.try_recv().unwrap() {
        CoreEvent::ApprovalDecided { source, approved, .. } => {
            assert!(approved);
            assert_eq!(source, DecisionSource::AutoApproved);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn ui_decision_resolves_and_is_remembered() {
    let gate = Arc::new(gate());
    let mut prompts = gate.subscribe_requests();

    let handler = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            let prompt = prompts.recv().await.unwrap();
            assert_eq!(prompt.request.tool_name, "Bash");
            assert_eq!(gate.pending_for_session("s1").await.len(), 1);
            gate.resolve(
                &prompt.request_id,
                ApprovalResponse::allow().remembered(RuleScope::Session),
            )
            .await
        })
    };

    let response = gate
        .request_approval(
            bash("s1", "make"),
            &AutonomyFlags::default(),
            &CancellationToken::new(),
        )
        .await;
    assert!(handler.await.unwrap());
    assert!(response.approved);
    assert!(gate.pending_for_session("s1").await.is_empty());

    // Remembered for the session, so no second prompt.
    assert!(gate.is_approved("s1", "Bash", &json!({"command": "make test"})).await);
}

#[tokio::test]
async fn cancelled_wait_denies() {
    let gate = Arc::new(gate());
    let _prompts = gate.subscribe_requests();
    let cancel = CancellationToken::new();

    let waiter = {
        let gate = Arc::clone(&gate);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            gate.request_approval(bash("s1", "ls"), &AutonomyFlags::default(), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let response = waiter.await.unwrap();
    assert!(!response.approved);
    assert_eq!(response.reason.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn autonomy_flags_skip_ui_prompt() {
    let gate = gate();
    let mut prompts = gate.subscribe_requests();
    let response = gate
        .request_approval(
            bash("s1", "rm -rf build"),
            &AutonomyFlags::full(),
            &CancellationToken::new(),
        )
        .await;
    assert!(response.approved);
    assert!(matches!(prompts.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn rules_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("approval-rules.json");

    {
        let gate = gate_with(Arc::new(JsonRuleRepository::new(&path)));
        gate.record_decision(
            &bash("s1", "ls"),
            &ApprovalResponse::allow().remembered(RuleScope::Global),
        )
        .await;
        gate.record_decision(
            &ApprovalRequest::new("s1", "Write", json!({}), "/tmp"),
            &ApprovalResponse::deny("no writes").remembered(RuleScope::Session),
        )
        .await;
    }

    let gate = gate_with(Arc::new(JsonRuleRepository::new(&path)));
    let rules = gate.rules().await;
    assert_eq!(rules.len(), 2);
    assert!(gate.is_approved("s9", "Bash", &json!({})).await);
    assert!(!gate.is_approved("s1", "Write", &json!({})).await);

    gate.clear_session("s1").await;
    let reloaded = gate_with(Arc::new(JsonRuleRepository::new(&path)));
    assert_eq!(reloaded.rules().await.len(), 1);
}

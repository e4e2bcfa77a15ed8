//! Shared harness: a scripted in-process backend and an orchestrator wired to it.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentdesk_core::Config;
use agentdesk_core::config::StreamingSettings;
use agentdesk_core::rules::{MemoryRuleRepository, RuleRepository};
use agentdesk_engine::Orchestrator;
use agentdesk_engine::backend::{
    AgentBackend, BackendConnector, BackendError, BackendEvent, BackendSession,
    BackendSessionConfig, HookDecision, ToolHooks, ToolUse,
};
use agentdesk_engine::streaming::{PartialMessage, StaticSettingsProvider};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// One step of a scripted turn.
#[derive(Debug, Clone)]
pub enum Step {
    Emit(BackendEvent),
    Sleep(Duration),
    /// Ask the session's pre-tool-use hook, then report the tool as
    /// succeeded when allowed.
    Tool {
        id: &'static str,
        name: &'static str,
        args: serde_json::Value,
    },
    /// Block until the turn is aborted, then close the channel.
    Hang,
}

pub fn text(s: &str) -> Step {
    Step::Emit(BackendEvent::ContentDelta { text: s.into() })
}

pub fn idle() -> Step {
    Step::Emit(BackendEvent::SessionIdle)
}

/// A turn that answers with `s` and finishes.
pub fn reply(s: &str) -> Vec<Step> {
    vec![Step::Emit(BackendEvent::TurnStart), text(s), idle()]
}

/// In-process backend replaying one script per prompt.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    hooks: Mutex<HashMap<String, Arc<dyn ToolHooks>>>,
    turns: Mutex<HashMap<String, CancellationToken>>,
    pub prompts: Mutex<Vec<String>>,
    pub decisions: Arc<Mutex<Vec<HookDecision>>>,
    pub starts: AtomicUsize,
    pub aborts: AtomicUsize,
    pub disposes: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn decisions(&self) -> Vec<HookDecision> {
        self.decisions.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn start_session(
        &self,
        config: BackendSessionConfig,
    ) -> Result<BackendSession, BackendError> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst);
        let id = format!("backend-{n}");
        self.hooks.lock().unwrap().insert(id.clone(), config.hooks);
        Ok(BackendSession {
            resume_token: Some(format!("resume-{n}")),
            id,
        })
    }

    async fn resume_session(
        &self,
        _resume_token: &str,
        config: BackendSessionConfig,
    ) -> Result<BackendSession, BackendError> {
        self.start_session(config).await
    }

    async fn send_prompt(
        &self,
        session: &BackendSession,
        prompt: &str,
    ) -> Result<mpsc::Receiver<BackendEvent>, BackendError> {
        let hooks = self
            .hooks
            .lock()
            .unwrap()
            .get(&session.id)
            .cloned()
            .ok_or_else(|| BackendError::SessionNotFound {
                id: session.id.clone(),
            })?;
        self.prompts.lock().unwrap().push(prompt.to_string());
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| reply("ok"));
        let turn = CancellationToken::new();
        self.turns
            .lock()
            .unwrap()
            .insert(session.id.clone(), turn.clone());

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(play(steps, tx, hooks, turn, Arc::clone(&self.decisions)));
        Ok(rx)
    }

    async fn abort(&self, session: &BackendSession) -> Result<(), BackendError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        if let Some(turn) = self.turns.lock().unwrap().get(&session.id) {
            turn.cancel();
        }
        Ok(())
    }

    async fn dispose(&self, session: &BackendSession) -> Result<(), BackendError> {
        self.disposes.fetch_add(1, Ordering::SeqCst);
        self.hooks.lock().unwrap().remove(&session.id);
        Ok(())
    }
}

async fn play(
    steps: Vec<Step>,
    tx: mpsc::Sender<BackendEvent>,
    hooks: Arc<dyn ToolHooks>,
    turn: CancellationToken,
    decisions: Arc<Mutex<Vec<HookDecision>>>,
) {
    for step in steps {
        match step {
            Step::Emit(event) => {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Step::Sleep(d) => tokio::time::sleep(d).await,
            Step::Tool { id, name, args } => {
                let start = BackendEvent::ToolStart {
                    tool_call_id: id.into(),
                    tool_name: name.into(),
                    arguments: args.clone(),
                };
                if tx.send(start).await.is_err() {
                    return;
                }
                // The permission request trails the tool_use message.
                tokio::time::sleep(Duration::from_millis(10)).await;
                let decision = hooks
                    .pre_tool_use(&ToolUse {
                        tool_name: name.into(),
                        arguments: args,
                        tool_call_id: Some(id.into()),
                    })
                    .await;
                let (success, output) = match &decision {
                    HookDecision::Allow => (true, "done".to_string()),
                    HookDecision::Deny { reason } => (false, reason.clone()),
                };
                decisions.lock().unwrap().push(decision);
                let complete = BackendEvent::ToolComplete {
                    tool_call_id: id.into(),
                    success,
                    output,
                };
                if tx.send(complete).await.is_err() {
                    return;
                }
            }
            Step::Hang => {
                turn.cancelled().await;
                return;
            }
        }
    }
}

/// Connector that fails a fixed number of times before handing out the backend.
pub struct FakeConnector {
    pub backend: Arc<ScriptedBackend>,
    pub connects: AtomicUsize,
    failures: AtomicUsize,
}

impl FakeConnector {
    pub fn new(backend: Arc<ScriptedBackend>) -> Arc<Self> {
        Self::failing(backend, 0)
    }

    pub fn failing(backend: Arc<ScriptedBackend>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            backend,
            connects: AtomicUsize::new(0),
            failures: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl BackendConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn AgentBackend>, BackendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Unavailable {
                reason: "backend not running".into(),
            });
        }
        Ok(Arc::clone(&self.backend) as Arc<dyn AgentBackend>)
    }
}

pub fn fast_settings() -> StreamingSettings {
    StreamingSettings {
        poll_interval_ms: 5,
        ..StreamingSettings::default()
    }
}

pub fn orchestrator_with(
    connector: Arc<FakeConnector>,
    settings: StreamingSettings,
    rules: Arc<dyn RuleRepository>,
) -> Orchestrator {
    Orchestrator::new(
        &Config::default(),
        connector,
        rules,
        Arc::new(StaticSettingsProvider(settings)),
    )
}

pub fn orchestrator(backend: &Arc<ScriptedBackend>) -> Orchestrator {
    orchestrator_with(
        FakeConnector::new(Arc::clone(backend)),
        fast_settings(),
        Arc::new(MemoryRuleRepository::new()),
    )
}

pub async fn collect(stream: impl Stream<Item = PartialMessage>) -> Vec<PartialMessage> {
    let mut stream = pin!(stream);
    let mut messages = Vec::new();
    while let Some(message) = stream.next().await {
        messages.push(message);
    }
    messages
}

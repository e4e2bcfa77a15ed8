//! Wiring of the engine components.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentdesk_core::Config;
use agentdesk_core::rules::{JsonRuleRepository, MemoryRuleRepository, RuleRepository};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::approval::ApprovalGate;
use crate::backend::{BackendConnector, ClaudeCliConnector};
use crate::connector::SessionConnector;
use crate::events::EventBus;
use crate::iteration::IterationEngine;
use crate::streaming::{ConfigSettingsProvider, SettingsProvider, StreamingCoordinator, StreamingRegistry};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Owns one instance of each component, sharing a single event bus.
pub struct Orchestrator {
    pub events: EventBus,
    pub gate: Arc<ApprovalGate>,
    pub connector: Arc<SessionConnector>,
    pub streaming: Arc<StreamingCoordinator>,
    pub iteration: Arc<IterationEngine>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        backend: Arc<dyn BackendConnector>,
        rules: Arc<dyn RuleRepository>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        let events = EventBus::default();
        let registry = Arc::new(StreamingRegistry::new());
        let gate = Arc::new(
            ApprovalGate::new(rules, events.clone(), config.approvals.request_timeout())
                .with_wait_observer(Arc::clone(&registry) as _),
        );
        let connector = Arc::new(
            SessionConnector::new(backend, Arc::clone(&gate))
                .with_default_model(config.backend.default_model.clone()),
        );
        let streaming = Arc::new(StreamingCoordinator::new(
            Arc::clone(&connector),
            registry,
            settings,
            events.clone(),
        ));
        let iteration = Arc::new(IterationEngine::new(
            Arc::clone(&connector),
            Arc::clone(&streaming),
            events.clone(),
            config.iteration.default_max_iterations,
        ));
        Self {
            events,
            gate,
            connector,
            streaming,
            iteration,
        }
    }

    /// Orchestrator backed by the Claude CLI, the configured rule file and
    /// the settings hierarchy rooted at `project_dir`.
    pub fn from_config(config: &Config, project_dir: Option<PathBuf>) -> Self {
        let backend = Arc::new(ClaudeCliConnector::new(
            config.backend.cli_bin.clone(),
            Duration::from_secs(config.backend.terminate_timeout_secs),
        ));
        let rules: Arc<dyn RuleRepository> = match config.approvals.resolved_rules_path() {
            Some(path) => {
                info!(path = %path.display(), "Using approval rule file");
                Arc::new(JsonRuleRepository::new(path))
            }
            None => {
                info!("No rule file location, approval rules are kept in memory");
                Arc::new(MemoryRuleRepository::new())
            }
        };
        let settings = Arc::new(ConfigSettingsProvider::new(project_dir));
        Self::new(config, backend, rules, settings)
    }

    /// Tear down everything held for a session.
    pub async fn close_session(&self, session_id: &str) {
        self.iteration.clear_task(session_id).await;
        self.streaming.remove_session(session_id).await;
        self.gate.clear_session(session_id).await;
        self.connector.close_session(session_id).await;
        info!(session_id, "Closed session");
    }

    /// Periodically sweep expired approval prompts until `shutdown` fires.
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let gate = Arc::clone(&self.gate);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let swept = gate.cleanup_expired().await;
                        if swept > 0 {
                            debug!(swept, "Swept expired approval prompts");
                        }
                    }
                }
            }
        })
    }
}

//! Session connector.
//!
//! Owns the process-wide backend client and the mapping from engine session
//! ids to backend sessions. Hooks wired at creation route tool permission
//! checks into the approval gate.

mod hooks;

pub use hooks::GateHooks;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::approval::ApprovalGate;
use crate::backend::{
    AgentBackend, BackendConnector, BackendError, BackendEvent, BackendSession,
    BackendSessionConfig,
};
use crate::session::SharedSession;

/// Slack on top of the gate timeout before a hook gives up on the gate.
const HOOK_CEILING_SLACK: Duration = Duration::from_secs(5);

/// Errors from connector operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Failed to connect to the agent backend: {0}")]
    Connection(#[source] BackendError),

    #[error("Failed to create backend session for {session_id}: {source}")]
    SessionCreation {
        session_id: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to send prompt: {0}")]
    Send(#[source] BackendError),
}

/// Changes applied by [`SessionConnector::recreate_session`].
#[derive(Debug, Clone, Default)]
pub struct RecreateOptions {
    pub new_model: Option<String>,
    pub new_working_directory: Option<PathBuf>,
}

struct SessionEntry {
    handle: BackendSession,
    /// Cancels approval waits of this backend session's hooks.
    shutdown: CancellationToken,
    /// The handle came from resuming a stored token.
    resumed: bool,
}

pub struct SessionConnector {
    backend_connector: Arc<dyn BackendConnector>,
    client: Mutex<Option<Arc<dyn AgentBackend>>>,
    handles: RwLock<HashMap<String, SessionEntry>>,
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    gate: Arc<ApprovalGate>,
    hook_ceiling: Duration,
    /// Model for sessions that do not name one.
    default_model: Option<String>,
}

impl SessionConnector {
    pub fn new(backend_connector: Arc<dyn BackendConnector>, gate: Arc<ApprovalGate>) -> Self {
        let hook_ceiling = gate.request_timeout().saturating_add(HOOK_CEILING_SLACK);
        Self {
            backend_connector,
            client: Mutex::new(None),
            handles: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            gate,
            hook_ceiling,
            default_model: None,
        }
    }

    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Connected backend client, bootstrapping it on first use.
    ///
    /// Concurrent callers share one connection attempt. A failed attempt is
    /// not cached.
    pub async fn ensure_client(&self) -> Result<Arc<dyn AgentBackend>, ConnectorError> {
        let mut client = self.client.lock().await;
        if let Some(backend) = client.as_ref() {
            return Ok(Arc::clone(backend));
        }
        let backend = self
            .backend_connector
            .connect()
            .await
            .map_err(ConnectorError::Connection)?;
        info!("Connected to agent backend");
        *client = Some(Arc::clone(&backend));
        Ok(backend)
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        self.handles.read().await.contains_key(session_id)
    }

    /// Backend session for `session`, resuming or starting one if needed.
    ///
    /// A failed resume falls back to a fresh session. The resulting resume
    /// token is written back onto `session`.
    pub async fn get_or_create_session(
        &self,
        session: &SharedSession,
    ) -> Result<BackendSession, ConnectorError> {
        let session_id = session.read().await.session_id.clone();
        if let Some(handle) = self.cached_handle(&session_id).await {
            return Ok(handle);
        }

        let lock = self.creation_lock(&session_id).await;
        let _creating = lock.lock().await;
        if let Some(handle) = self.cached_handle(&session_id).await {
            return Ok(handle);
        }

        let backend = self.ensure_client().await?;
        let shutdown = CancellationToken::new();
        let (config, resume_token) = {
            let s = session.read().await;
            let hooks = GateHooks::new(
                Arc::clone(&self.gate),
                Arc::clone(session),
                shutdown.clone(),
                self.hook_ceiling,
            );
            if !s.enabled_tools.is_empty() {
                debug!(session_id = %session_id, tools = ?s.enabled_tools, "Enabled tools are enforced by the approval gate");
            }
            let config = BackendSessionConfig {
                session_id: s.session_id.clone(),
                model: s.model_id.clone().or_else(|| self.default_model.clone()),
                working_directory: s.working_directory.clone(),
                enabled_tools: s.enabled_tools.clone(),
                mcp_servers: s.mcp_servers.clone(),
                skills: s.skills.clone(),
                hooks: Arc::new(hooks),
            };
            (config, s.external_session_handle.clone())
        };

        let resumed = match resume_token {
            Some(token) => match backend.resume_session(&token, config.clone()).await {
                Ok(handle) => {
                    info!(session_id = %session_id, "Resumed backend session");
                    Some(handle)
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Resume failed, starting a new backend session");
                    None
                }
            },
            None => None,
        };
        let resumed_from_token = resumed.is_some();
        let handle = match resumed {
            Some(handle) => handle,
            None => {
                let handle = match backend.start_session(config).await {
                    Ok(handle) => handle,
                    Err(source) => {
                        if source.is_connection_loss() {
                            self.client.lock().await.take();
                        }
                        return Err(ConnectorError::SessionCreation { session_id, source });
                    }
                };
                info!(session_id = %session_id, backend_session = %handle.id, "Started backend session");
                handle
            }
        };

        if let Some(token) = &handle.resume_token {
            session.write().await.external_session_handle = Some(token.clone());
        }
        self.handles.write().await.insert(
            session_id,
            SessionEntry {
                handle: handle.clone(),
                shutdown,
                resumed: resumed_from_token,
            },
        );
        Ok(handle)
    }

    /// Replace the backend session, optionally switching model or working
    /// directory. The old session is disposed best-effort.
    pub async fn recreate_session(
        &self,
        session: &SharedSession,
        options: RecreateOptions,
    ) -> Result<BackendSession, ConnectorError> {
        let session_id = session.read().await.session_id.clone();
        self.dispose_entry(&session_id).await;
        {
            let mut s = session.write().await;
            s.external_session_handle = None;
            if let Some(model) = options.new_model {
                s.model_id = Some(model);
            }
            if let Some(dir) = options.new_working_directory {
                s.working_directory = dir;
            }
        }
        info!(session_id = %session_id, "Recreating backend session");
        self.get_or_create_session(session).await
    }

    /// Interrupt the in-flight turn. Failures are logged, never returned.
    pub async fn abort(&self, session_id: &str) {
        let cancelled = self.gate.cancel_pending(session_id).await;
        if cancelled > 0 {
            debug!(session_id, cancelled, "Cancelled pending approvals");
        }
        let Some(handle) = self.cached_handle(session_id).await else {
            return;
        };
        let Some(backend) = self.client.lock().await.clone() else {
            return;
        };
        if let Err(e) = backend.abort(&handle).await {
            warn!(session_id, error = %e, "Failed to abort backend turn");
        }
    }

    /// Dispose and forget the backend session.
    pub async fn close_session(&self, session_id: &str) {
        self.dispose_entry(session_id).await;
        self.creation_locks.lock().await.remove(session_id);
    }

    /// Submit a prompt, creating the backend session if needed.
    ///
    /// A rejected handle is disposed. When the backend session is gone the
    /// prompt is retried once on a new one; a resume token that led to a dead
    /// session is dropped first. A lost connection drops the client as well.
    pub async fn send_prompt(
        &self,
        session: &SharedSession,
        prompt: &str,
    ) -> Result<mpsc::Receiver<BackendEvent>, ConnectorError> {
        match self.send_once(session, prompt).await {
            Err(ConnectorError::Send(e)) if e.is_session_gone() => {
                info!(error = %e, "Backend session is gone, retrying on a new one");
                self.send_once(session, prompt).await
            }
            result => result,
        }
    }

    async fn send_once(
        &self,
        session: &SharedSession,
        prompt: &str,
    ) -> Result<mpsc::Receiver<BackendEvent>, ConnectorError> {
        let handle = self.get_or_create_session(session).await?;
        let backend = self.ensure_client().await?;
        let e = match backend.send_prompt(&handle, prompt).await {
            Ok(rx) => return Ok(rx),
            Err(e) => e,
        };

        let session_id = session.read().await.session_id.clone();
        warn!(session_id = %session_id, error = %e, "Backend rejected prompt");
        if !matches!(e, BackendError::Busy { .. }) {
            let resumed = self.dispose_entry(&session_id).await;
            if resumed && e.is_session_gone() {
                let mut s = session.write().await;
                if s.external_session_handle == handle.resume_token {
                    info!(session_id = %session_id, "Dropping resume token of a dead session");
                    s.external_session_handle = None;
                }
            }
        }
        if e.is_connection_loss() {
            self.client.lock().await.take();
        }
        Err(ConnectorError::Send(e))
    }

    async fn cached_handle(&self, session_id: &str) -> Option<BackendSession> {
        self.handles
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.handle.clone())
    }

    async fn creation_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.creation_locks.lock().await;
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    /// Dispose and forget the session's handle. Returns whether the handle
    /// came from a resume.
    async fn dispose_entry(&self, session_id: &str) -> bool {
        let Some(entry) = self.handles.write().await.remove(session_id) else {
            return false;
        };
        entry.shutdown.cancel();
        let Some(backend) = self.client.lock().await.clone() else {
            return entry.resumed;
        };
        match backend.dispose(&entry.handle).await {
            Ok(()) => debug!(session_id, "Disposed backend session"),
            Err(e) => warn!(session_id, error = %e, "Failed to dispose backend session"),
        }
        entry.resumed
    }
}

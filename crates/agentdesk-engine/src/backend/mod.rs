//! Agent backend abstraction.
//!
//! The engine talks to the coding agent only through [`AgentBackend`]. A
//! backend owns its sessions; the engine holds opaque [`BackendSession`]
//! handles and receives one event channel per prompt.

pub mod bridge;
pub mod claude_cli;

pub use claude_cli::{ClaudeCliBackend, ClaudeCliConnector};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Handle to a session living inside the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSession {
    /// Backend-local identifier.
    pub id: String,
    /// Token that lets a later process resume this conversation.
    pub resume_token: Option<String>,
}

/// Events emitted by the backend while a prompt is processed.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Incremental assistant text.
    ContentDelta { text: String },
    /// One assistant message is complete. Not the end of the turn.
    ContentComplete { text: String },
    ToolStart {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    ToolComplete {
        tool_call_id: String,
        success: bool,
        output: String,
    },
    Reasoning { text: String },
    TurnStart,
    TurnEnd,
    /// The backend finished processing the prompt.
    SessionIdle,
    SessionError { message: String },
}

/// A tool invocation the backend asks permission for.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub tool_call_id: Option<String>,
}

/// Outcome of the pre-tool-use hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Allow,
    Deny { reason: String },
}

impl HookDecision {
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Callbacks a backend invokes around tool execution.
///
/// `pre_tool_use` is infallible: every internal failure is a deny.
#[async_trait]
pub trait ToolHooks: Send + Sync {
    async fn pre_tool_use(&self, tool: &ToolUse) -> HookDecision;

    async fn post_tool_use(&self, _tool_call_id: &str, _success: bool) {}

    async fn on_error(&self, _message: &str) {}
}

/// Everything a backend needs to create or resume a session.
#[derive(Clone)]
pub struct BackendSessionConfig {
    /// Engine-side session id, for logging.
    pub session_id: String,
    pub model: Option<String>,
    pub working_directory: PathBuf,
    pub enabled_tools: Vec<String>,
    pub mcp_servers: Vec<String>,
    pub skills: Vec<String>,
    pub hooks: Arc<dyn ToolHooks>,
}

impl std::fmt::Debug for BackendSessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSessionConfig")
            .field("session_id", &self.session_id)
            .field("model", &self.model)
            .field("working_directory", &self.working_directory)
            .field("enabled_tools", &self.enabled_tools)
            .field("mcp_servers", &self.mcp_servers)
            .field("skills", &self.skills)
            .finish_non_exhaustive()
    }
}

/// A connected agent backend.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn start_session(
        &self,
        config: BackendSessionConfig,
    ) -> Result<BackendSession, BackendError>;

    async fn resume_session(
        &self,
        resume_token: &str,
        config: BackendSessionConfig,
    ) -> Result<BackendSession, BackendError>;

    /// Submit a prompt. The returned channel closes after `SessionIdle` or
    /// `SessionError`.
    async fn send_prompt(
        &self,
        session: &BackendSession,
        prompt: &str,
    ) -> Result<mpsc::Receiver<BackendEvent>, BackendError>;

    /// Interrupt the in-flight turn.
    async fn abort(&self, session: &BackendSession) -> Result<(), BackendError>;

    /// Release all resources held for the session.
    async fn dispose(&self, session: &BackendSession) -> Result<(), BackendError>;
}

/// Bootstraps the process-wide backend client.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn AgentBackend>, BackendError>;
}

/// Errors from backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Agent backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Failed to spawn backend process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Backend session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Failed to resume backend session: {reason}")]
    ResumeFailed { reason: String },

    #[error("Backend session {id} is already processing a prompt")]
    Busy { id: String },

    #[error("Backend process exited: {id}")]
    ProcessExited { id: String },

    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether the process-wide client should be dropped and bootstrapped again.
    pub const fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Io(_))
    }

    /// Whether the backend session behind the handle no longer exists.
    pub const fn is_session_gone(&self) -> bool {
        matches!(self, Self::SessionNotFound { .. } | Self::ProcessExited { .. })
    }
}

//! Chat session record shared with the UI layer.
//!
//! The engine reads most fields and writes back only the resume token
//! (`external_session_handle`) and the fields a recreate changes.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Session handle shared between the UI and the engine.
pub type SharedSession = Arc<RwLock<Session>>;

/// Autonomous-mode switches that bypass the human approval step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutonomyFlags {
    /// Approve every tool call.
    pub allow_all: bool,
    /// Approve every tool call (tool-level switch).
    pub allow_all_tools: bool,
    /// Approve file and path tools.
    pub allow_all_paths: bool,
    /// Approve URL and web tools.
    pub allow_all_urls: bool,
}

impl AutonomyFlags {
    /// Everything allowed.
    pub const fn full() -> Self {
        Self {
            allow_all: true,
            allow_all_tools: true,
            allow_all_paths: true,
            allow_all_urls: true,
        }
    }

    pub const fn any(&self) -> bool {
        self.allow_all || self.allow_all_tools || self.allow_all_paths || self.allow_all_urls
    }
}

/// A chat session as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub working_directory: PathBuf,
    /// Model override; the configured default applies when `None`.
    #[serde(default)]
    pub model_id: Option<String>,
    /// Backend resume token from the last created or resumed backend session.
    #[serde(default)]
    pub external_session_handle: Option<String>,
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub autonomy: AutonomyFlags,
}

impl Session {
    pub fn new(session_id: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            working_directory: working_directory.into(),
            model_id: None,
            external_session_handle: None,
            enabled_tools: Vec::new(),
            mcp_servers: Vec::new(),
            skills: Vec::new(),
            autonomy: AutonomyFlags::default(),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    #[must_use]
    pub const fn with_autonomy(mut self, autonomy: AutonomyFlags) -> Self {
        self.autonomy = autonomy;
        self
    }

    #[must_use]
    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        self.external_session_handle = Some(token.into());
        self
    }

    /// Wrap for sharing with the engine.
    pub fn shared(self) -> SharedSession {
        Arc::new(RwLock::new(self))
    }
}

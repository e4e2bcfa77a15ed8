//! Configuration resolution for `AgentDesk`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/agentdesk/settings.json`)
//! 3. Project config (`.agentdesk/settings.json`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete `AgentDesk` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub streaming: StreamingSettings,
    #[serde(default)]
    pub approvals: ApprovalConfig,
    #[serde(default)]
    pub iteration: IterationConfig,
}

/// Agent backend (Claude Code CLI) configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Path to the `claude` binary.
    pub cli_bin: PathBuf,
    /// Model used when a session does not name one.
    pub default_model: String,
    /// Seconds to wait for graceful subprocess shutdown before SIGKILL.
    pub terminate_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            cli_bin: PathBuf::from("claude"),
            default_model: "claude-sonnet-4-20250514".to_string(),
            terminate_timeout_secs: 5,
        }
    }
}

/// Timeout and warning policy for streaming turns.
///
/// This is the settings document the streaming coordinator caches and
/// refreshes periodically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamingSettings {
    /// No-activity timeout while idle or streaming text.
    pub idle_timeout_seconds: u64,
    /// No-activity timeout while a tool runs.
    pub tool_execution_timeout_seconds: u64,
    /// No-activity timeout while a tool call waits for a human decision.
    pub approval_wait_timeout_seconds: u64,
    /// Upper bound on warnings emitted between two backend events.
    pub max_consecutive_warnings: u32,
    /// Delay between two polls of the accumulated message.
    pub poll_interval_ms: u64,
    /// How long a loaded copy of these settings stays fresh.
    pub refresh_interval_seconds: u64,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 180,
            tool_execution_timeout_seconds: 600,
            // Longer than the gate's own ceiling so the gate denies first.
            approval_wait_timeout_seconds: 360,
            max_consecutive_warnings: 3,
            poll_interval_ms: 50,
            refresh_interval_seconds: 5 * 60,
        }
    }
}

impl StreamingSettings {
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub const fn tool_execution_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_execution_timeout_seconds)
    }

    pub const fn approval_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_wait_timeout_seconds)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }
}

/// Tool approval configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Hard ceiling on waiting for a human decision (seconds).
    pub request_timeout_secs: u64,
    /// Where approval rules are persisted. Defaults next to the global config.
    pub rules_path: Option<PathBuf>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 5 * 60,
            rules_path: None,
        }
    }
}

impl ApprovalConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Configured rules path, falling back to the default location.
    pub fn resolved_rules_path(&self) -> Option<PathBuf> {
        self.rules_path.clone().or_else(default_rules_path)
    }
}

/// Iterative task defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IterationConfig {
    pub default_max_iterations: u32,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: 10,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".agentdesk").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Directory holding the global settings and the rule store.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("agentdesk"))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Default location of the persisted approval rules.
pub fn default_rules_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("approval-rules.json"))
}

/// Read a single settings file.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.backend = overlay.backend;
    base.streaming = overlay.streaming;
    if overlay.approvals.rules_path.is_some() {
        base.approvals.rules_path = overlay.approvals.rules_path;
    }
    base.approvals.request_timeout_secs = overlay.approvals.request_timeout_secs;
    base.iteration = overlay.iteration;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("AGENTDESK_CLAUDE_BIN") {
        config.backend.cli_bin = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("AGENTDESK_DEFAULT_MODEL") {
        config.backend.default_model = val;
    }
    if let Ok(val) = std::env::var("AGENTDESK_IDLE_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.streaming.idle_timeout_seconds = n;
    }
    if let Ok(val) = std::env::var("AGENTDESK_TOOL_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.streaming.tool_execution_timeout_seconds = n;
    }
    if let Ok(val) = std::env::var("AGENTDESK_APPROVAL_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.approvals.request_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("AGENTDESK_RULES_PATH") {
        config.approvals.rules_path = Some(PathBuf::from(val));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_approval_ceiling_is_five_minutes() {
        let config = Config::default();
        assert_eq!(config.approvals.request_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn approval_wait_outlasts_gate_ceiling() {
        let config = Config::default();
        assert!(
            config.streaming.approval_wait_timeout() > config.approvals.request_timeout()
        );
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"streaming":{"idleTimeoutSeconds":30}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.streaming.idle_timeout_seconds, 30);
        assert_eq!(config.streaming.max_consecutive_warnings, 3);
        assert_eq!(config.backend, BackendConfig::default());
    }

    #[test]
    fn project_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join(".agentdesk");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(
            project.join("settings.json"),
            r#"{"iteration":{"default_max_iterations":4}}"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert_eq!(config.iteration.default_max_iterations, 4);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }
}

//! Static tool risk heuristics.
//!
//! Risk is display metadata on approval requests. It never gates a decision
//! by itself; the auto-approve list below does.

use serde::{Deserialize, Serialize};

/// How dangerous a tool invocation looks from its name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const CRITICAL_KEYWORDS: &[&str] = &[
    "shell", "bash", "exec", "terminal", "powershell", "command", "spawn", "sudo",
];
const HIGH_KEYWORDS: &[&str] = &[
    "write", "delete", "remove", "edit", "create", "move", "rename", "patch", "push", "kill",
];
const LOW_PREFIXES: &[&str] = &["read", "get", "list", "view", "search", "find", "glob", "grep"];

/// Internal or read-only tools that never need a human decision.
const AUTO_APPROVED_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "LS",
    "TodoWrite",
    "read_file",
    "list_directory",
    "view",
    "glob",
    "grep",
    "search_files",
    "get_file_info",
    "report_intent",
    "task_complete",
];

/// Name prefixes treated as read-only.
const AUTO_APPROVED_PREFIXES: &[&str] = &["read_", "get_", "list_", "view_", "search_"];

/// Classify a tool by name.
pub fn tool_risk_level(tool_name: &str) -> RiskLevel {
    let name = tool_name.to_ascii_lowercase();

    if CRITICAL_KEYWORDS.iter().any(|k| name.contains(k)) {
        return RiskLevel::Critical;
    }
    if HIGH_KEYWORDS.iter().any(|k| name.contains(k)) {
        return RiskLevel::High;
    }
    if LOW_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return RiskLevel::Low;
    }
    RiskLevel::Medium
}

/// Whether a tool is on the low-risk list that bypasses approval.
pub fn is_auto_approved(tool_name: &str) -> bool {
    if AUTO_APPROVED_TOOLS.contains(&tool_name) {
        return true;
    }
    let name = tool_name.to_ascii_lowercase();
    AUTO_APPROVED_PREFIXES.iter().any(|p| name.starts_with(p))
}

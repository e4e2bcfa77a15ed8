//! Iterative task records.

use serde::{Deserialize, Serialize};

/// Lifecycle of an iterative task. Every state after `Running` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
    Stopped,
    MaxIterationsReached,
}

impl TaskStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::MaxIterationsReached
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::MaxIterationsReached => "max_iterations_reached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One tool call observed during an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionRecord {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    /// `None` while the tool is still running.
    pub success: Option<bool>,
    pub output: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningStep {
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationEvaluation {
    pub criteria_met: bool,
    pub summary: String,
    pub failed_tool_count: usize,
}

/// Outcome of one prompt, response and evaluation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationResult {
    /// 1-based.
    pub iteration_number: u32,
    pub status: IterationStatus,
    pub tool_executions: Vec<ToolExecutionRecord>,
    pub reasoning_steps: Vec<ReasoningStep>,
    pub result_text: String,
    pub is_complete: bool,
    pub evaluation: Option<IterationEvaluation>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub status: TaskStatus,
    pub current_iteration: u32,
    pub iterations: Vec<IterationResult>,
}

/// An iterative task bound to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterativeTaskConfig {
    pub task_description: String,
    pub success_criteria: String,
    pub max_iterations: u32,
    #[serde(default)]
    pub state: TaskState,
}

impl IterativeTaskConfig {
    pub fn new(
        task_description: impl Into<String>,
        success_criteria: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        Self {
            task_description: task_description.into(),
            success_criteria: success_criteria.into(),
            max_iterations,
            state: TaskState::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::NotStarted.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        for status in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Stopped,
            TaskStatus::MaxIterationsReached,
        ] {
            assert!(status.is_terminal(), "{}", status.as_str());
        }
    }

    #[test]
    fn task_config_serializes_camel_case() {
        let task = IterativeTaskConfig::new("fix the build", "cargo test passes", 3);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["maxIterations"], 3);
        assert_eq!(json["state"]["status"], "not_started");
        assert_eq!(json["state"]["currentIteration"], 0);
    }
}

//! Per-session streaming state machine.

use std::time::{Duration, Instant};

use agentdesk_core::config::StreamingSettings;
use serde::{Deserialize, Serialize};

use crate::backend::BackendEvent;

/// Where a streaming turn currently stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingState {
    #[default]
    Idle,
    Streaming,
    ToolExecuting,
    WaitingForApproval,
    Completed,
    Error,
    Cancelled,
}

impl StreamingState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// No-activity limit for this state. Terminal states have none.
    pub const fn timeout(self, settings: &StreamingSettings) -> Option<Duration> {
        match self {
            Self::Idle | Self::Streaming => Some(settings.idle_timeout()),
            Self::ToolExecuting => Some(settings.tool_execution_timeout()),
            Self::WaitingForApproval => Some(settings.approval_wait_timeout()),
            Self::Completed | Self::Error | Self::Cancelled => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::ToolExecuting => "tool execution",
            Self::WaitingForApproval => "approval wait",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result of a timeout check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCheck {
    Ok,
    Warning { elapsed: Duration, limit: Duration },
    Expired { limit: Duration },
}

/// Streaming bookkeeping for one session.
#[derive(Debug, Clone)]
pub struct SessionStreamingContext {
    pub state: StreamingState,
    pub current_tool_name: Option<String>,
    pub tools_executed_count: u32,
    pub event_count: u64,
    pub state_entered_at: Instant,
    pub last_event_at: Instant,
    /// Warnings emitted since the last backend event.
    pub warning_count: u32,
    warned_half: bool,
    warned_late: bool,
    /// Tool calls started but not completed, in start order.
    running_tools: Vec<(String, String)>,
    /// Approval prompts currently waited on.
    approval_waits: u32,
    /// State to return to once the last approval wait ends.
    resume_state: StreamingState,
}

impl Default for SessionStreamingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStreamingContext {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: StreamingState::Idle,
            current_tool_name: None,
            tools_executed_count: 0,
            event_count: 0,
            state_entered_at: now,
            last_event_at: now,
            warning_count: 0,
            warned_half: false,
            warned_late: false,
            running_tools: Vec::new(),
            approval_waits: 0,
            resume_state: StreamingState::Idle,
        }
    }

    pub fn transition(&mut self, next: StreamingState) {
        if self.state != next {
            self.state = next;
            self.state_entered_at = Instant::now();
            self.warned_half = false;
            self.warned_late = false;
        }
    }

    /// Apply a backend event. Ignored once the turn is terminal.
    pub fn apply(&mut self, event: &BackendEvent) {
        if self.state.is_terminal() {
            return;
        }
        self.event_count += 1;
        self.last_event_at = Instant::now();
        self.warning_count = 0;
        self.warned_half = false;
        self.warned_late = false;

        match event {
            BackendEvent::ContentDelta { .. } => self.settle(),
            BackendEvent::ToolStart {
                tool_call_id,
                tool_name,
                ..
            } => {
                self.running_tools
                    .push((tool_call_id.clone(), tool_name.clone()));
                self.settle();
            }
            BackendEvent::ToolComplete { tool_call_id, .. } => {
                self.tools_executed_count += 1;
                self.running_tools.retain(|(id, _)| id != tool_call_id);
                self.settle();
            }
            BackendEvent::SessionIdle => self.finish(StreamingState::Completed),
            BackendEvent::SessionError { .. } => self.finish(StreamingState::Error),
            BackendEvent::ContentComplete { .. }
            | BackendEvent::Reasoning { .. }
            | BackendEvent::TurnStart
            | BackendEvent::TurnEnd => {
                if self.state == StreamingState::Idle {
                    self.transition(StreamingState::Streaming);
                }
            }
        }
    }

    /// Move to the state implied by the running tools. While an approval
    /// prompt is open the move is deferred until the last wait ends.
    fn settle(&mut self) {
        self.current_tool_name = self.running_tools.last().map(|(_, name)| name.clone());
        let next = if self.running_tools.is_empty() {
            StreamingState::Streaming
        } else {
            StreamingState::ToolExecuting
        };
        if self.approval_waits > 0 {
            self.resume_state = next;
        } else {
            self.transition(next);
        }
    }

    fn finish(&mut self, terminal: StreamingState) {
        self.running_tools.clear();
        self.current_tool_name = None;
        self.approval_waits = 0;
        self.transition(terminal);
    }

    /// Approval waits nest. The state before the first one is restored
    /// when the last one ends.
    pub fn enter_approval_wait(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if self.approval_waits == 0 {
            self.resume_state = self.state;
            self.transition(StreamingState::WaitingForApproval);
        }
        self.approval_waits += 1;
    }

    pub fn exit_approval_wait(&mut self) {
        if self.approval_waits == 0 {
            return;
        }
        self.approval_waits -= 1;
        if self.approval_waits == 0 && self.state == StreamingState::WaitingForApproval {
            self.transition(self.resume_state);
        }
    }

    /// Number of approval prompts currently waited on.
    pub const fn approval_waits(&self) -> u32 {
        self.approval_waits
    }

    /// Time without activity in the current state.
    pub fn inactive_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state_entered_at.max(self.last_event_at))
    }

    /// Compare inactivity with the current state's limit.
    ///
    /// Warnings fire once at 50% and once at 80% of the limit, at most
    /// `max_consecutive_warnings` times between two backend events.
    pub fn check_timeout(&mut self, settings: &StreamingSettings, now: Instant) -> TimeoutCheck {
        let Some(limit) = self.state.timeout(settings) else {
            return TimeoutCheck::Ok;
        };
        let elapsed = self.inactive_for(now);
        if elapsed >= limit {
            return TimeoutCheck::Expired { limit };
        }
        if self.warning_count >= settings.max_consecutive_warnings {
            return TimeoutCheck::Ok;
        }

        let late = elapsed.as_secs_f64() >= limit.as_secs_f64() * 0.8;
        let half = elapsed.as_secs_f64() >= limit.as_secs_f64() * 0.5;
        if (late && !self.warned_late) || (half && !self.warned_half) {
            self.warned_half = true;
            self.warned_late = late;
            self.warning_count += 1;
            return TimeoutCheck::Warning { elapsed, limit };
        }
        TimeoutCheck::Ok
    }
}

/// Text appended to the message when a turn times out.
pub fn timeout_notice(state: StreamingState, limit: Duration) -> String {
    format!(
        "\n\n[No response during {} for {}s; the request was stopped.]",
        state.as_str(),
        limit.as_secs()
    )
}

//! Process-wide event bus.
//!
//! A tokio broadcast channel of [`CoreEvent`]s. Publishing never blocks; a
//! listener that falls behind loses the oldest events and sees `Lagged`.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::approval::DecisionSource;
use crate::iteration::{IterationResult, TaskStatus};
use crate::streaming::StreamingState;

const DEFAULT_CAPACITY: usize = 1024;

/// Events published by the engine components.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CoreEvent {
    StreamingProgressChanged {
        session_id: String,
        state: StreamingState,
        current_tool_name: Option<String>,
        tools_executed_count: u32,
        event_count: u64,
    },
    StreamingWarning {
        session_id: String,
        state: StreamingState,
        elapsed_secs: u64,
        timeout_secs: u64,
    },
    TaskStatusChanged {
        session_id: String,
        previous: TaskStatus,
        status: TaskStatus,
        reason: Option<String>,
        current_iteration: u32,
        max_iterations: u32,
    },
    IterationCompleted {
        session_id: String,
        result: IterationResult,
    },
    ApprovalDecided {
        session_id: String,
        tool_name: String,
        approved: bool,
        source: DecisionSource,
        reason: Option<String>,
    },
    ToolExecutionStarted {
        session_id: String,
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    ToolExecutionCompleted {
        session_id: String,
        tool_call_id: String,
        success: bool,
        output: String,
    },
    ReasoningObserved {
        session_id: String,
        text: String,
    },
}

impl CoreEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::StreamingProgressChanged { session_id, .. }
            | Self::StreamingWarning { session_id, .. }
            | Self::TaskStatusChanged { session_id, .. }
            | Self::IterationCompleted { session_id, .. }
            | Self::ApprovalDecided { session_id, .. }
            | Self::ToolExecutionStarted { session_id, .. }
            | Self::ToolExecutionCompleted { session_id, .. }
            | Self::ReasoningObserved { session_id, .. } => session_id,
        }
    }
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no listeners is not an error.
    pub fn publish(&self, event: CoreEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event bus listeners");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

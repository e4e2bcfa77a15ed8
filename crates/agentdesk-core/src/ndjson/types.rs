//! Message types for the Claude Code stream-json protocol.

use serde_json::Value;
use std::path::PathBuf;

/// Canonical messages read from the CLI's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SystemInit(SystemInit),
    Assistant(AssistantMessage),
    User(UserMessage),
    StreamEvent(StreamEvent),
    ControlRequest(ControlRequest),
    ControlResponse { request_id: String },
    Result(SessionResult),
    Unknown { msg_type: String, payload: Value },
}

/// `system`/`init`: emitted at the start of each turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInit {
    pub session_id: String,
    pub model: String,
    pub cwd: PathBuf,
    pub tools: Vec<String>,
}

/// A complete assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

impl AssistantMessage {
    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Content block in an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
}

/// User message echoing tool results back into the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub tool_results: Vec<ToolResult>,
}

/// Result of one tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Partial-message streaming event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    MessageStart,
    TextDelta(String),
    ThinkingDelta(String),
    MessageStop,
    Other(String),
}

/// Request from the CLI that expects a `control_response`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_id: String,
    pub request: ControlRequestType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequestType {
    /// Permission check before running a tool.
    CanUseTool {
        tool_name: String,
        input: Value,
        tool_use_id: Option<String>,
    },
    Unknown(Value),
}

/// End-of-turn summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub session_id: String,
    pub subtype: String,
    pub is_error: bool,
    pub result: Option<String>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
}

impl SessionResult {
    /// Claude can send `is_error: true` alongside `subtype: "success"` and no
    /// error messages; only a non-success subtype or explicit errors count.
    pub fn is_real_error(&self) -> bool {
        self.is_error && (self.subtype != "success" || !self.errors.is_empty())
    }
}

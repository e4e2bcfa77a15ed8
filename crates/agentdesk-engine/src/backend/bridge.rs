//! NDJSON to backend event bridge.
//!
//! Converts parsed Claude Code messages into [`BackendEvent`]s and builds the
//! JSON lines written back to the CLI's stdin.

use agentdesk_core::ndjson::{
    AssistantMessage, ContentBlock, Message, SessionResult, StreamEvent, UserMessage,
};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::BackendEvent;

/// Maximum tool output kept on a `ToolComplete` event.
const MAX_TOOL_OUTPUT: usize = 4000;

/// Stateful converter for one CLI process.
#[derive(Debug, Default)]
pub struct MessageBridge {
    /// Tool calls awaiting results (id -> name).
    pending_tools: HashMap<String, String>,
    /// Text for the current message already arrived as stream deltas.
    streamed_text: bool,
    /// Claude's own session id, from the last `system`/`init`.
    claude_session_id: Option<String>,
}

impl MessageBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claude_session_id(&self) -> Option<&str> {
        self.claude_session_id.as_deref()
    }

    /// Name of a tool call that has started but not completed.
    pub fn pending_tool_name(&self, tool_call_id: &str) -> Option<&str> {
        self.pending_tools.get(tool_call_id).map(String::as_str)
    }

    /// Convert one message. Control requests are answered by the backend and
    /// produce no events here.
    pub fn convert(&mut self, msg: Message) -> Vec<BackendEvent> {
        match msg {
            Message::SystemInit(init) => {
                self.claude_session_id = Some(init.session_id);
                vec![BackendEvent::TurnStart]
            }
            Message::Assistant(assistant) => self.handle_assistant(&assistant),
            Message::User(user) => self.handle_user(user),
            Message::StreamEvent(event) => self.handle_stream_event(event),
            Message::Result(result) => self.handle_result(&result),
            Message::ControlRequest(_) | Message::ControlResponse { .. } => vec![],
            Message::Unknown { msg_type, .. } => {
                warn!(msg_type, "Unknown NDJSON message type");
                vec![]
            }
        }
    }

    fn handle_assistant(&mut self, msg: &AssistantMessage) -> Vec<BackendEvent> {
        let mut events = Vec::new();

        let text = msg.text();
        if !text.is_empty() {
            // Without partial messages the full text is the only delta we get.
            if !self.streamed_text {
                events.push(BackendEvent::ContentDelta { text: text.clone() });
            }
            events.push(BackendEvent::ContentComplete { text });
        }
        self.streamed_text = false;

        for block in &msg.content {
            match block {
                ContentBlock::Thinking { thinking } if !thinking.is_empty() => {
                    events.push(BackendEvent::Reasoning {
                        text: thinking.clone(),
                    });
                }
                ContentBlock::ToolUse { id, name, input } => {
                    self.pending_tools.insert(id.clone(), name.clone());
                    events.push(BackendEvent::ToolStart {
                        tool_call_id: id.clone(),
                        tool_name: name.clone(),
                        arguments: input.clone(),
                    });
                }
                _ => {}
            }
        }

        events
    }

    fn handle_user(&mut self, msg: UserMessage) -> Vec<BackendEvent> {
        msg.tool_results
            .into_iter()
            .map(|result| {
                if self.pending_tools.remove(&result.tool_use_id).is_none() {
                    debug!(tool_use_id = %result.tool_use_id, "Tool result without matching start");
                }
                BackendEvent::ToolComplete {
                    tool_call_id: result.tool_use_id,
                    success: !result.is_error,
                    output: truncate_str(&result.content, MAX_TOOL_OUTPUT),
                }
            })
            .collect()
    }

    fn handle_stream_event(&mut self, event: StreamEvent) -> Vec<BackendEvent> {
        match event {
            StreamEvent::MessageStart => {
                self.streamed_text = false;
                vec![]
            }
            StreamEvent::TextDelta(text) if !text.is_empty() => {
                self.streamed_text = true;
                vec![BackendEvent::ContentDelta { text }]
            }
            _ => vec![],
        }
    }

    fn handle_result(&mut self, result: &SessionResult) -> Vec<BackendEvent> {
        self.streamed_text = false;
        if !self.pending_tools.is_empty() {
            debug!(
                count = self.pending_tools.len(),
                "Turn ended with unfinished tool calls"
            );
            self.pending_tools.clear();
        }

        if result.is_real_error() {
            let message = if result.errors.is_empty() {
                result
                    .result
                    .clone()
                    .unwrap_or_else(|| format!("Turn failed: {}", result.subtype))
            } else {
                result.errors.join("; ")
            };
            vec![
                BackendEvent::TurnEnd,
                BackendEvent::SessionError { message },
            ]
        } else {
            vec![BackendEvent::TurnEnd, BackendEvent::SessionIdle]
        }
    }
}

/// Build the JSON line carrying a user prompt.
pub fn user_message_json(prompt: &str) -> String {
    serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": prompt }]
        }
    })
    .to_string()
}

/// Build the JSON line for a permission `control_response`.
///
/// An allow must echo the original input as `updatedInput`; the CLI rejects
/// an allow without it and treats `{}` as "replace all arguments".
pub fn permission_response_json(
    request_id: &str,
    deny_reason: Option<&str>,
    original_input: &serde_json::Value,
) -> String {
    let response = match deny_reason {
        None => serde_json::json!({
            "behavior": "allow",
            "updatedInput": original_input
        }),
        Some(reason) => serde_json::json!({
            "behavior": "deny",
            "message": reason,
            "interrupt": false
        }),
    };

    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response
        }
    })
    .to_string()
}

/// Build an `interrupt` control request.
pub fn interrupt_request_json(request_id: &str) -> String {
    serde_json::json!({
        "type": "control_request",
        "request_id": request_id,
        "request": { "subtype": "interrupt" }
    })
    .to_string()
}

/// Short human-readable summary of a tool call for approval prompts.
pub fn tool_description(name: &str, input: &serde_json::Value) -> String {
    let Some(obj) = input.as_object() else {
        return String::new();
    };
    let field = |key: &str| obj.get(key).and_then(serde_json::Value::as_str);

    match name {
        "Bash" => field("command")
            .map(|c| truncate_str(c, 120))
            .unwrap_or_default(),
        "Read" | "Write" | "Edit" | "MultiEdit" => field("file_path").unwrap_or("").to_string(),
        "Grep" => format!(
            "{} in {}",
            truncate_str(field("pattern").unwrap_or(""), 60),
            field("path").unwrap_or(".")
        ),
        "Glob" => field("pattern").unwrap_or("").to_string(),
        "WebFetch" => field("url").unwrap_or("").to_string(),
        _ => obj
            .values()
            .find_map(serde_json::Value::as_str)
            .map(|s| truncate_str(s, 80))
            .unwrap_or_default(),
    }
}

/// Truncate on a char boundary, appending `...` when shortened.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let boundary = s
            .char_indices()
            .take_while(|(i, _)| *i <= max)
            .last()
            .map_or(0, |(i, _)| i);
        format!("{}...", &s[..boundary])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use agentdesk_core::ndjson::parse_line;

    fn convert_line(bridge: &mut MessageBridge, line: &str) -> Vec<BackendEvent> {
        bridge.convert(parse_line(line).unwrap())
    }

    #[test]
    fn assistant_text_without_deltas_becomes_delta_and_complete() {
        let mut bridge = MessageBridge::new();
        let events = convert_line(
            &mut bridge,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hi"}]}}"#,
        );
        assert_eq!(
            events,
            vec![
                BackendEvent::ContentDelta { text: "Hi".into() },
                BackendEvent::ContentComplete { text: "Hi".into() },
            ]
        );
    }

    #[test]
    fn streamed_text_is_not_duplicated() {
        let mut bridge = MessageBridge::new();
        let delta = convert_line(
            &mut bridge,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}}"#,
        );
        assert_eq!(delta, vec![BackendEvent::ContentDelta { text: "Hi".into() }]);

        let events = convert_line(
            &mut bridge,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hi"}]}}"#,
        );
        assert_eq!(
            events,
            vec![BackendEvent::ContentComplete { text: "Hi".into() }]
        );
    }

    #[test]
    fn tool_use_and_result_pair_up() {
        let mut bridge = MessageBridge::new();
        let start = convert_line(
            &mut bridge,
            r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"look"},{"type":"tool_use","id":"tu_1","name":"Bash","input":{"command":"ls"}}]}}"#,
        );
        assert_eq!(start.len(), 2);
        assert!(matches!(start[0], BackendEvent::Reasoning { .. }));
        assert_eq!(bridge.pending_tool_name("tu_1"), Some("Bash"));

        let done = convert_line(
            &mut bridge,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu_1","content":"ok","is_error":false}]}}"#,
        );
        assert_eq!(
            done,
            vec![BackendEvent::ToolComplete {
                tool_call_id: "tu_1".into(),
                success: true,
                output: "ok".into(),
            }]
        );
        assert!(bridge.pending_tool_name("tu_1").is_none());
    }

    #[test]
    fn result_ends_turn_with_idle() {
        let mut bridge = MessageBridge::new();
        let events = convert_line(
            &mut bridge,
            r#"{"type":"result","subtype":"success","session_id":"c1","is_error":false}"#,
        );
        assert_eq!(
            events,
            vec![BackendEvent::TurnEnd, BackendEvent::SessionIdle]
        );
    }

    #[test]
    fn error_result_ends_turn_with_error() {
        let mut bridge = MessageBridge::new();
        let events = convert_line(
            &mut bridge,
            r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#,
        );
        assert!(matches!(
            &events[1],
            BackendEvent::SessionError { message } if message.contains("error_max_turns")
        ));
    }

    #[test]
    fn system_init_starts_turn_and_records_id() {
        let mut bridge = MessageBridge::new();
        let events = convert_line(
            &mut bridge,
            r#"{"type":"system","subtype":"init","session_id":"claude-1","model":"m","cwd":"/"}"#,
        );
        assert_eq!(events, vec![BackendEvent::TurnStart]);
        assert_eq!(bridge.claude_session_id(), Some("claude-1"));
    }

    #[test]
    fn allow_response_echoes_input() {
        let input = serde_json::json!({"command": "ls"});
        let line = permission_response_json("req_1", None, &input);
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["response"]["request_id"], "req_1");
        assert_eq!(json["response"]["response"]["behavior"], "allow");
        assert_eq!(json["response"]["response"]["updatedInput"], input);
    }

    #[test]
    fn deny_response_carries_reason() {
        let line = permission_response_json("req_2", Some("nope"), &serde_json::Value::Null);
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["response"]["response"]["behavior"], "deny");
        assert_eq!(json["response"]["response"]["message"], "nope");
    }

    #[test]
    fn tool_description_grep() {
        let desc = tool_description(
            "Grep",
            &serde_json::json!({"pattern": "fn main", "path": "src/"}),
        );
        assert_eq!(desc, "fn main in src/");
    }

    #[test]
    fn tool_description_unknown_tool_uses_first_string() {
        let desc = tool_description("read_file", &serde_json::json!({"path": "a.rs"}));
        assert_eq!(desc, "a.rs");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(100);
        let out = truncate_str(&s, 11);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 14);
    }
}

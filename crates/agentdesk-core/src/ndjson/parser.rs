//! NDJSON parser for the Claude Code protocol.
//!
//! Tolerant reader: unknown fields are ignored, unknown message types come
//! back as [`Message::Unknown`].

use serde_json::Value;

use super::types::{
    AssistantMessage, ContentBlock, ControlRequest, ControlRequestType, Message, SessionResult,
    StreamEvent, SystemInit, ToolResult, UserMessage,
};
use crate::error::{Error, Result};

/// Parse a single NDJSON line.
pub fn parse_line(line: &str) -> Result<Message> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical message.
pub fn parse_value(raw: &Value) -> Result<Message> {
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))?;

    match msg_type {
        "system" if str_field(raw, "subtype") == "init" => Ok(parse_system_init(raw)),
        "assistant" => Ok(parse_assistant(raw)),
        "user" => Ok(parse_user(raw)),
        "stream_event" => Ok(parse_stream_event(raw)),
        "control_request" => parse_control_request(raw),
        "control_response" => Ok(Message::ControlResponse {
            request_id: raw
                .get("response")
                .map(|r| str_field(r, "request_id"))
                .unwrap_or_default(),
        }),
        "result" => Ok(parse_result(raw)),
        _ => Ok(Message::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

fn str_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_system_init(raw: &Value) -> Message {
    let tools = raw
        .get("tools")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    t.as_str()
                        .or_else(|| t.get("name").and_then(Value::as_str))
                        .map(String::from)
                })
                .collect()
        })
        .unwrap_or_default();

    Message::SystemInit(SystemInit {
        session_id: str_field(raw, "session_id"),
        model: str_field(raw, "model"),
        cwd: str_field(raw, "cwd").into(),
        tools,
    })
}

fn parse_assistant(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);
    let content = msg
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| blocks.iter().filter_map(parse_content_block).collect())
        .unwrap_or_default();

    Message::Assistant(AssistantMessage {
        content,
        stop_reason: msg
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(String::from),
    })
}

fn parse_content_block(block: &Value) -> Option<ContentBlock> {
    match block.get("type")?.as_str()? {
        "text" => Some(ContentBlock::Text {
            text: block.get("text")?.as_str()?.to_string(),
        }),
        "thinking" => Some(ContentBlock::Thinking {
            thinking: block.get("thinking")?.as_str()?.to_string(),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: block.get("id")?.as_str()?.to_string(),
            name: block.get("name")?.as_str()?.to_string(),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        _ => None,
    }
}

fn parse_user(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);
    let tool_results = msg
        .get("content")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
                .filter_map(|block| {
                    Some(ToolResult {
                        tool_use_id: block.get("tool_use_id")?.as_str()?.to_string(),
                        content: tool_result_text(block.get("content")),
                        is_error: block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Message::User(UserMessage { tool_results })
}

/// Tool result content is either a string or a list of text blocks.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_stream_event(raw: &Value) -> Message {
    let event = raw.get("event").unwrap_or(raw);
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");

    let parsed = match event_type {
        "message_start" => StreamEvent::MessageStart,
        "message_stop" => StreamEvent::MessageStop,
        "content_block_delta" => {
            let delta = event.get("delta").unwrap_or(&Value::Null);
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => StreamEvent::TextDelta(str_field(delta, "text")),
                Some("thinking_delta") => {
                    StreamEvent::ThinkingDelta(str_field(delta, "thinking"))
                }
                other => StreamEvent::Other(other.unwrap_or("delta").to_string()),
            }
        }
        other => StreamEvent::Other(other.to_string()),
    };

    Message::StreamEvent(parsed)
}

fn parse_control_request(raw: &Value) -> Result<Message> {
    let request_id = raw
        .get("request_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing request_id".into()))?
        .to_string();

    let request = raw.get("request").cloned().unwrap_or(Value::Null);
    let request_type = if str_field(&request, "subtype") == "can_use_tool" {
        ControlRequestType::CanUseTool {
            tool_name: str_field(&request, "tool_name"),
            input: request.get("input").cloned().unwrap_or(Value::Null),
            tool_use_id: request
                .get("tool_use_id")
                .and_then(Value::as_str)
                .map(String::from),
        }
    } else {
        ControlRequestType::Unknown(request)
    };

    Ok(Message::ControlRequest(ControlRequest {
        request_id,
        request: request_type,
    }))
}

fn parse_result(raw: &Value) -> Message {
    let subtype = raw
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or("success")
        .to_string();
    let errors = raw
        .get("errors")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Message::Result(SessionResult {
        session_id: str_field(raw, "session_id"),
        subtype,
        is_error: raw
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        result: raw.get("result").and_then(Value::as_str).map(String::from),
        errors,
        duration_ms: raw.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
        cost_usd: raw.get("total_cost_usd").and_then(Value::as_f64),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parse_system_init_line() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc123","model":"claude-sonnet-4","cwd":"/home/user","tools":["Bash","Read"]}"#;
        let Message::SystemInit(init) = parse_line(json).unwrap() else {
            panic!("expected system init");
        };
        assert_eq!(init.session_id, "abc123");
        assert_eq!(init.tools, vec!["Bash", "Read"]);
    }

    #[test]
    fn parse_assistant_with_tool_use_and_thinking() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"plan"},{"type":"text","text":"Running"},{"type":"tool_use","id":"tu_1","name":"Bash","input":{"command":"ls"}}],"stop_reason":"tool_use"}}"#;
        let Message::Assistant(msg) = parse_line(json).unwrap() else {
            panic!("expected assistant message");
        };
        assert_eq!(msg.content.len(), 3);
        assert_eq!(msg.text(), "Running");
        assert_eq!(msg.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn parse_tool_result_list_content() {
        let json = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu_1","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}],"is_error":true}]}}"#;
        let Message::User(user) = parse_line(json).unwrap() else {
            panic!("expected user message");
        };
        assert_eq!(user.tool_results[0].content, "a\nb");
        assert!(user.tool_results[0].is_error);
    }

    #[test]
    fn parse_text_delta() {
        let json = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}}"#;
        assert_eq!(
            parse_line(json).unwrap(),
            Message::StreamEvent(StreamEvent::TextDelta("Hel".into()))
        );
    }

    #[test]
    fn parse_can_use_tool_request() {
        let json = r#"{"type":"control_request","request_id":"req_001","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"},"tool_use_id":"tu_9"}}"#;
        let Message::ControlRequest(req) = parse_line(json).unwrap() else {
            panic!("expected control request");
        };
        assert_eq!(req.request_id, "req_001");
        assert!(matches!(
            req.request,
            ControlRequestType::CanUseTool { ref tool_name, ref tool_use_id, .. }
                if tool_name == "Bash" && tool_use_id.as_deref() == Some("tu_9")
        ));
    }

    #[test]
    fn control_request_without_id_is_error() {
        let json = r#"{"type":"control_request","request":{"subtype":"can_use_tool"}}"#;
        assert!(parse_line(json).is_err());
    }

    #[test]
    fn spurious_error_flag_is_not_real_error() {
        let json = r#"{"type":"result","subtype":"success","is_error":true,"session_id":"s"}"#;
        let Message::Result(result) = parse_line(json).unwrap() else {
            panic!("expected result");
        };
        assert!(!result.is_real_error());
    }

    #[test]
    fn error_result_with_messages_is_real_error() {
        let json = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"errors":["boom"]}"#;
        let Message::Result(result) = parse_line(json).unwrap() else {
            panic!("expected result");
        };
        assert!(result.is_real_error());
        assert_eq!(result.errors, vec!["boom"]);
    }

    #[test]
    fn unknown_type_returns_unknown_message() {
        let json = r#"{"type":"future_type","data":"something"}"#;
        assert!(matches!(
            parse_line(json).unwrap(),
            Message::Unknown { .. }
        ));
    }

    #[test]
    fn missing_type_is_error() {
        assert!(matches!(
            parse_line(r#"{"data":1}"#),
            Err(Error::NdjsonParse(_))
        ));
    }
}

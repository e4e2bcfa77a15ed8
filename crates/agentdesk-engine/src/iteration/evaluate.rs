//! Completion heuristics for iteration responses.

use super::types::{IterationEvaluation, ToolExecutionRecord};

/// Phrases that mark a response as claiming the task is done. Matched
/// case-insensitively anywhere in the text.
const COMPLETION_PHRASES: &[&str] = &[
    "task complete",
    "task completed",
    "task is complete",
    "all success criteria are met",
    "all success criteria have been met",
    "success criteria met",
    "successfully completed the task",
];

/// Tools whose successful execution marks the task as done.
const COMPLETION_TOOLS: &[&str] = &["task_complete", "mark_complete"];

pub fn contains_completion_phrase(text: &str) -> bool {
    let lower = text.to_lowercase();
    COMPLETION_PHRASES.iter().any(|p| lower.contains(p))
}

/// Classify one iteration from its final text and tool calls.
pub fn evaluate(result_text: &str, tools: &[ToolExecutionRecord]) -> IterationEvaluation {
    let failed_tool_count = tools.iter().filter(|t| t.success == Some(false)).count();
    let completion_tool = tools
        .iter()
        .any(|t| t.success == Some(true) && COMPLETION_TOOLS.contains(&t.tool_name.as_str()));

    if completion_tool || contains_completion_phrase(result_text) {
        return IterationEvaluation {
            criteria_met: true,
            summary: first_line(result_text).unwrap_or("Task reported complete").to_string(),
            failed_tool_count,
        };
    }

    let summary = if failed_tool_count > 0 {
        format!("{failed_tool_count} tool execution(s) failed")
    } else {
        first_line(result_text)
            .unwrap_or("No completion signal in response")
            .to_string()
    };
    IterationEvaluation {
        criteria_met: false,
        summary,
        failed_tool_count,
    }
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, success: Option<bool>) -> ToolExecutionRecord {
        ToolExecutionRecord {
            tool_call_id: format!("{name}-1"),
            tool_name: name.into(),
            arguments: serde_json::Value::Null,
            success,
            output: None,
            started_at: 0,
            completed_at: None,
        }
    }

    #[test]
    fn completion_phrase_is_case_insensitive() {
        assert!(contains_completion_phrase("Done.\nTASK COMPLETE"));
        assert!(contains_completion_phrase("All success criteria are met."));
        assert!(!contains_completion_phrase("Still working on the task."));
    }

    #[test]
    fn completion_tool_counts_only_when_successful() {
        assert!(evaluate("", &[tool("task_complete", Some(true))]).criteria_met);
        assert!(!evaluate("", &[tool("task_complete", Some(false))]).criteria_met);
        assert!(!evaluate("", &[tool("task_complete", None)]).criteria_met);
    }

    #[test]
    fn failed_tools_are_counted() {
        let eval = evaluate(
            "Tried again",
            &[tool("Bash", Some(false)), tool("Bash", Some(false)), tool("Read", Some(true))],
        );
        assert!(!eval.criteria_met);
        assert_eq!(eval.failed_tool_count, 2);
        assert_eq!(eval.summary, "2 tool execution(s) failed");
    }

    #[test]
    fn plain_response_summarizes_first_line() {
        let eval = evaluate("\n  Refactored the parser\nDetails", &[]);
        assert!(!eval.criteria_met);
        assert_eq!(eval.summary, "Refactored the parser");
    }
}

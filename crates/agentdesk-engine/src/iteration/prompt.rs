//! Prompt construction for task iterations.

use std::fmt::Write as _;

use super::types::{IterationResult, IterationStatus, IterativeTaskConfig};

const SUMMARY_CHARS: usize = 120;

/// Prompt for iteration `iteration` (1-based) of `task`.
///
/// Embeds the task, the success criteria, the iteration counter and one line
/// per earlier iteration.
pub fn build_iteration_prompt(task: &IterativeTaskConfig, iteration: u32) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "## Task\n{}\n", task.task_description.trim());
    let _ = writeln!(prompt, "## Success criteria\n{}\n", task.success_criteria.trim());
    let _ = writeln!(prompt, "## Iteration {iteration} of {}", task.max_iterations);

    if !task.state.iterations.is_empty() {
        prompt.push_str("\n## Previous iterations\n");
        for result in &task.state.iterations {
            prompt.push_str(&digest_line(result));
            prompt.push('\n');
        }
    }

    prompt.push_str(
        "\nWork towards the success criteria. When they are fully met, say \
         \"TASK COMPLETE\" and summarize what was done.",
    );
    prompt
}

fn digest_line(result: &IterationResult) -> String {
    let outcome = match result.status {
        IterationStatus::Failed => "failed",
        IterationStatus::Cancelled => "cancelled",
        IterationStatus::Running | IterationStatus::Completed => {
            if result.is_complete {
                "criteria met"
            } else {
                "criteria not met"
            }
        }
    };
    let summary = result
        .evaluation
        .as_ref()
        .map_or(result.result_text.as_str(), |e| e.summary.as_str());
    format!(
        "- #{} ({outcome}): {}",
        result.iteration_number,
        one_line(summary, SUMMARY_CHARS)
    )
}

/// First line of `text`, cut to `max` characters.
fn one_line(text: &str, max: usize) -> String {
    let line = text.trim().lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(max).collect();
    cut.push_str("...");
    cut
}

//! Iterative task execution.

mod engine;
mod evaluate;
mod prompt;
mod types;

pub use engine::{IterationEngine, IterationError};
pub use evaluate::{contains_completion_phrase, evaluate};
pub use prompt::build_iteration_prompt;
pub use types::{
    IterationEvaluation, IterationResult, IterationStatus, IterativeTaskConfig, ReasoningStep,
    TaskState, TaskStatus, ToolExecutionRecord,
};

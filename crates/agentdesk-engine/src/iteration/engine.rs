//! Iterative task loop.
//!
//! Runs bounded sequences of agent turns for a session until the response
//! claims the success criteria are met, the iteration limit is reached, or
//! the loop is stopped.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};

use agentdesk_core::time::unix_timestamp_ms;
use tokio::sync::RwLock;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::evaluate::evaluate;
use super::prompt::build_iteration_prompt;
use super::types::{
    IterationResult, IterationStatus, IterativeTaskConfig, ReasoningStep, TaskState, TaskStatus,
    ToolExecutionRecord,
};
use crate::connector::SessionConnector;
use crate::events::{CoreEvent, EventBus};
use crate::session::SharedSession;
use crate::streaming::{PartialMessage, StreamingCoordinator, StreamingState};

#[derive(Debug, thiserror::Error)]
pub enum IterationError {
    #[error("No iterative task configured for session {session_id}")]
    NotConfigured { session_id: String },

    #[error("An iterative task is already running for session {session_id}")]
    AlreadyRunning { session_id: String },

    #[error("max_iterations must be at least 1")]
    InvalidMaxIterations,
}

/// Drives iterative tasks, at most one active loop per session.
pub struct IterationEngine {
    connector: Arc<SessionConnector>,
    streaming: Arc<StreamingCoordinator>,
    events: EventBus,
    tasks: RwLock<HashMap<String, IterativeTaskConfig>>,
    /// Cancellation tokens of running loops.
    running: RunningLoops,
    default_max_iterations: u32,
}

impl IterationEngine {
    pub fn new(
        connector: Arc<SessionConnector>,
        streaming: Arc<StreamingCoordinator>,
        events: EventBus,
        default_max_iterations: u32,
    ) -> Self {
        Self {
            connector,
            streaming,
            events,
            tasks: RwLock::new(HashMap::new()),
            running: RunningLoops::default(),
            default_max_iterations,
        }
    }

    /// Create or replace the session's task. `None` uses the configured
    /// default limit.
    pub async fn configure_task(
        &self,
        session_id: &str,
        task_description: impl Into<String>,
        success_criteria: impl Into<String>,
        max_iterations: Option<u32>,
    ) -> Result<IterativeTaskConfig, IterationError> {
        let max_iterations = max_iterations.unwrap_or(self.default_max_iterations);
        if max_iterations == 0 {
            return Err(IterationError::InvalidMaxIterations);
        }
        if self.is_running(session_id) {
            return Err(IterationError::AlreadyRunning {
                session_id: session_id.to_string(),
            });
        }
        let task = IterativeTaskConfig::new(task_description, success_criteria, max_iterations);
        self.tasks
            .write()
            .await
            .insert(session_id.to_string(), task.clone());
        info!(session_id, max_iterations, "Configured iterative task");
        Ok(task)
    }

    /// Remove the session's task, stopping its loop first.
    pub async fn clear_task(&self, session_id: &str) -> Option<IterativeTaskConfig> {
        self.stop_task(session_id).await;
        self.tasks.write().await.remove(session_id)
    }

    pub async fn task(&self, session_id: &str) -> Option<IterativeTaskConfig> {
        self.tasks.read().await.get(session_id).cloned()
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    /// Run the session's task in the background.
    pub async fn start_task(
        self: &Arc<Self>,
        session: SharedSession,
    ) -> Result<JoinHandle<TaskStatus>, IterationError> {
        let run = self.claim(&session).await?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.run_loop(run, session).await }))
    }

    /// Run the session's task to a terminal status.
    pub async fn run_task(self: &Arc<Self>, session: SharedSession) -> Result<TaskStatus, IterationError> {
        let run = self.claim(&session).await?;
        Ok(Arc::clone(self).run_loop(run, session).await)
    }

    /// Stop the session's loop and interrupt the in-flight turn. `false` if
    /// no loop was running.
    pub async fn stop_task(&self, session_id: &str) -> bool {
        let token = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned();
        let Some(token) = token else {
            return false;
        };
        info!(session_id, "Stopping iterative task");
        token.cancel();
        self.connector.abort(session_id).await;
        true
    }

    /// Register a run and reset the task state. Fails if the task is missing
    /// or already running.
    async fn claim(&self, session: &SharedSession) -> Result<RunGuard, IterationError> {
        let session_id = session.read().await.session_id.clone();
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&session_id) else {
            return Err(IterationError::NotConfigured { session_id });
        };

        let cancel = CancellationToken::new();
        {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if running.contains_key(&session_id) {
                return Err(IterationError::AlreadyRunning { session_id });
            }
            running.insert(session_id.clone(), cancel.clone());
        }
        task.state = TaskState::default();
        Ok(RunGuard {
            running: Arc::clone(&self.running),
            session_id,
            cancel,
        })
    }

    async fn run_loop(self: Arc<Self>, run: RunGuard, session: SharedSession) -> TaskStatus {
        let session_id = run.session_id.clone();
        self.set_status(&session_id, TaskStatus::Running, None).await;

        loop {
            if run.cancel.is_cancelled() {
                return self
                    .set_status(&session_id, TaskStatus::Stopped, Some("stopped"))
                    .await;
            }

            let next = {
                let tasks = self.tasks.read().await;
                tasks.get(&session_id).map(|task| {
                    let n = task.state.current_iteration + 1;
                    (n, task.max_iterations, build_iteration_prompt(task, n))
                })
            };
            let Some((n, max_iterations, prompt)) = next else {
                warn!(session_id = %session_id, "Task removed while running");
                return TaskStatus::Stopped;
            };
            if n > max_iterations {
                return self
                    .set_status(
                        &session_id,
                        TaskStatus::MaxIterationsReached,
                        Some("iteration limit reached"),
                    )
                    .await;
            }

            info!(session_id = %session_id, iteration = n, max_iterations, "Starting iteration");
            let iteration = tokio::spawn(Arc::clone(&self).run_iteration(
                Arc::clone(&session),
                n,
                prompt,
                run.cancel.child_token(),
            ));
            let result = match iteration.await {
                Ok(result) => result,
                Err(e) => {
                    error!(session_id = %session_id, iteration = n, error = %e, "Iteration aborted");
                    return self
                        .set_status(&session_id, TaskStatus::Failed, Some("iteration aborted unexpectedly"))
                        .await;
                }
            };

            let status = result.status;
            let complete = result.is_complete;
            self.record(&session_id, result).await;

            if status == IterationStatus::Cancelled || run.cancel.is_cancelled() {
                return self
                    .set_status(&session_id, TaskStatus::Stopped, Some("stopped"))
                    .await;
            }
            if complete {
                return self
                    .set_status(&session_id, TaskStatus::Completed, Some("success criteria met"))
                    .await;
            }
        }
    }

    /// One prompt, response and evaluation cycle. Failures are recorded in
    /// the result, never returned.
    async fn run_iteration(
        self: Arc<Self>,
        session: SharedSession,
        iteration_number: u32,
        prompt: String,
        cancel: CancellationToken,
    ) -> IterationResult {
        let session_id = session.read().await.session_id.clone();
        let started_at = unix_timestamp_ms();
        let mut observer = TurnObserver::default();
        let mut events = self.events.subscribe();
        let mut stream = pin!(self.streaming.start_streaming(session, prompt, cancel));

        let mut last: Option<PartialMessage> = None;
        let mut bus_open = true;
        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(message) => last = Some(message),
                    None => break,
                },
                event = events.recv(), if bus_open => match event {
                    Ok(event) => observer.observe(&session_id, event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %session_id, skipped, "Iteration missed events");
                    }
                    Err(RecvError::Closed) => bus_open = false,
                },
            }
        }
        loop {
            match events.try_recv() {
                Ok(event) => observer.observe(&session_id, event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(session_id = %session_id, skipped, "Iteration missed events");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }

        let (status, result_text) = match last {
            None => (
                IterationStatus::Failed,
                "The response stream ended without a message.".to_string(),
            ),
            Some(message) => {
                let status = match message.state {
                    StreamingState::Cancelled => IterationStatus::Cancelled,
                    StreamingState::Completed if !message.is_error => IterationStatus::Completed,
                    _ => IterationStatus::Failed,
                };
                (status, message.content)
            }
        };

        let evaluation = evaluate(&result_text, &observer.tools);
        let is_complete = status == IterationStatus::Completed && evaluation.criteria_met;
        debug!(
            session_id = %session_id,
            iteration = iteration_number,
            ?status,
            is_complete,
            tools = observer.tools.len(),
            "Iteration finished"
        );
        IterationResult {
            iteration_number,
            status,
            tool_executions: observer.tools,
            reasoning_steps: observer.reasoning,
            result_text,
            is_complete,
            evaluation: Some(evaluation),
            started_at,
            completed_at: Some(unix_timestamp_ms()),
        }
    }

    /// Append a finished iteration and advance the counter.
    async fn record(&self, session_id: &str, result: IterationResult) {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(session_id) else {
            return;
        };
        task.state.current_iteration = result.iteration_number.min(task.max_iterations);
        task.state.iterations.push(result.clone());
        drop(tasks);
        self.events.publish(CoreEvent::IterationCompleted {
            session_id: session_id.to_string(),
            result,
        });
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> TaskStatus {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(session_id) else {
            return status;
        };
        let previous = task.state.status;
        task.state.status = status;
        let event = CoreEvent::TaskStatusChanged {
            session_id: session_id.to_string(),
            previous,
            status,
            reason: reason.map(str::to_string),
            current_iteration: task.state.current_iteration,
            max_iterations: task.max_iterations,
        };
        drop(tasks);
        info!(session_id, from = previous.as_str(), to = status.as_str(), "Task status changed");
        self.events.publish(event);
        status
    }
}

type RunningLoops = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Releases the session's run slot when the loop ends or is dropped.
struct RunGuard {
    running: RunningLoops,
    session_id: String,
    cancel: CancellationToken,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

/// Collects tool and reasoning activity of one session from the event bus.
#[derive(Default)]
struct TurnObserver {
    tools: Vec<ToolExecutionRecord>,
    reasoning: Vec<ReasoningStep>,
}

impl TurnObserver {
    fn observe(&mut self, session_id: &str, event: CoreEvent) {
        if event.session_id() != session_id {
            return;
        }
        match event {
            CoreEvent::ToolExecutionStarted {
                tool_call_id,
                tool_name,
                arguments,
                ..
            } => self.tools.push(ToolExecutionRecord {
                tool_call_id,
                tool_name,
                arguments,
                success: None,
                output: None,
                started_at: unix_timestamp_ms(),
                completed_at: None,
            }),
            CoreEvent::ToolExecutionCompleted {
                tool_call_id,
                success,
                output,
                ..
            } => {
                if let Some(record) = self
                    .tools
                    .iter_mut()
                    .rev()
                    .find(|r| r.tool_call_id == tool_call_id)
                {
                    record.success = Some(success);
                    record.output = Some(output);
                    record.completed_at = Some(unix_timestamp_ms());
                } else {
                    debug!(session_id, tool_call_id = %tool_call_id, "Completion for unknown tool call");
                }
            }
            CoreEvent::ReasoningObserved { text, .. } => self.reasoning.push(ReasoningStep {
                text,
                timestamp: unix_timestamp_ms(),
            }),
            _ => {}
        }
    }
}

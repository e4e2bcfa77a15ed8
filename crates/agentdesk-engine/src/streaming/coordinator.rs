//! Streaming coordinator.
//!
//! Turns the backend event channel of one prompt into a finite stream of
//! [`PartialMessage`] snapshots. A delivery task applies events to the
//! session's shared turn state; the consumer side polls that state, enforces
//! per-state inactivity limits, and ends the stream on a terminal state.

use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{StreamingRegistry, TurnHandle};
use super::settings::{CachedSettings, SettingsProvider};
use super::state::{SessionStreamingContext, StreamingState, TimeoutCheck, timeout_notice};
use crate::backend::BackendEvent;
use crate::connector::SessionConnector;
use crate::events::{CoreEvent, EventBus};
use crate::session::SharedSession;

const STREAM_CLOSED_NOTICE: &str = "\n\n[The agent stopped responding before finishing.]";

/// Incrementally updated assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialMessage {
    pub session_id: String,
    pub message_id: String,
    pub content: String,
    pub is_streaming: bool,
    pub is_error: bool,
    pub state: StreamingState,
}

impl PartialMessage {
    fn error(session_id: &str, message_id: &str, content: String) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            content,
            is_streaming: false,
            is_error: true,
            state: StreamingState::Error,
        }
    }
}

/// Drives prompts through the backend and exposes them as streams.
pub struct StreamingCoordinator {
    connector: Arc<SessionConnector>,
    registry: Arc<StreamingRegistry>,
    settings: CachedSettings,
    events: EventBus,
}

impl StreamingCoordinator {
    pub fn new(
        connector: Arc<SessionConnector>,
        registry: Arc<StreamingRegistry>,
        settings: Arc<dyn SettingsProvider>,
        events: EventBus,
    ) -> Self {
        Self {
            connector,
            registry,
            settings: CachedSettings::new(settings),
            events,
        }
    }

    pub fn registry(&self) -> &Arc<StreamingRegistry> {
        &self.registry
    }

    /// Send `prompt` and stream the response.
    ///
    /// The stream is finite: its last item is non-streaming and carries the
    /// terminal state. Errors are reported as error-flagged messages.
    #[allow(clippy::too_many_lines)]
    pub fn start_streaming(
        self: &Arc<Self>,
        session: SharedSession,
        prompt: String,
        cancel: CancellationToken,
    ) -> impl Stream<Item = PartialMessage> + Send + 'static {
        let this = Arc::clone(self);
        stream! {
            let session_id = session.read().await.session_id.clone();
            let message_id = uuid::Uuid::new_v4().to_string();
            let settings = this.settings.current().await;

            let Some(turn) = this.registry.begin_turn(&session_id).await else {
                warn!(session_id = %session_id, "Rejected prompt while a response is streaming");
                yield PartialMessage::error(
                    &session_id,
                    &message_id,
                    "A response is already streaming for this session.".to_string(),
                );
                return;
            };
            let mut guard = TurnGuard {
                turn: Arc::clone(&turn),
                delivery: None,
                released: false,
            };

            let rx = match this.connector.send_prompt(&session, &prompt).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to send prompt");
                    let context = {
                        let mut t = turn.lock().await;
                        t.context.transition(StreamingState::Error);
                        t.context.clone()
                    };
                    this.publish_progress(&session_id, &context);
                    guard.release().await;
                    yield PartialMessage::error(
                        &session_id,
                        &message_id,
                        format!("Failed to reach the agent backend: {e}"),
                    );
                    return;
                }
            };

            info!(session_id = %session_id, message_id = %message_id, "Streaming started");
            let delivery = tokio::spawn(deliver_events(
                rx,
                Arc::clone(&turn),
                this.events.clone(),
                session_id.clone(),
            ));
            guard.delivery = Some(delivery.abort_handle());

            let mut last_state = StreamingState::Idle;
            let mut last_content_len = 0usize;

            loop {
                let cancelled = tokio::select! {
                    biased;
                    () = cancel.cancelled() => true,
                    () = tokio::time::sleep(settings.poll_interval()) => false,
                };
                let finished = turn.lock().await.context.state.is_terminal();
                if cancelled && !finished {
                    delivery.abort();
                    this.connector.abort(&session_id).await;
                    let (context, content) = {
                        let mut t = turn.lock().await;
                        t.context.transition(StreamingState::Cancelled);
                        (t.context.clone(), t.content.clone())
                    };
                    info!(session_id = %session_id, "Streaming cancelled");
                    this.publish_progress(&session_id, &context);
                    guard.release().await;
                    yield PartialMessage {
                        session_id: session_id.clone(),
                        message_id: message_id.clone(),
                        content,
                        is_streaming: false,
                        is_error: false,
                        state: StreamingState::Cancelled,
                    };
                    return;
                }

                let (context, content, check) = {
                    let mut t = turn.lock().await;
                    let state = t.context.state;
                    let check = t.context.check_timeout(&settings, Instant::now());
                    if let TimeoutCheck::Expired { limit } = check {
                        t.content.push_str(&timeout_notice(state, limit));
                        t.context.transition(StreamingState::Error);
                    }
                    (t.context.clone(), t.content.clone(), check)
                };

                match check {
                    TimeoutCheck::Ok => {}
                    TimeoutCheck::Warning { elapsed, limit } => {
                        warn!(
                            session_id = %session_id,
                            state = context.state.as_str(),
                            elapsed_secs = elapsed.as_secs(),
                            timeout_secs = limit.as_secs(),
                            "No backend activity"
                        );
                        this.events.publish(CoreEvent::StreamingWarning {
                            session_id: session_id.clone(),
                            state: context.state,
                            elapsed_secs: elapsed.as_secs(),
                            timeout_secs: limit.as_secs(),
                        });
                    }
                    TimeoutCheck::Expired { limit } => {
                        warn!(session_id = %session_id, timeout_secs = limit.as_secs(), "Streaming timed out");
                        delivery.abort();
                        this.connector.abort(&session_id).await;
                    }
                }

                let state_changed = context.state != last_state;
                if state_changed {
                    this.publish_progress(&session_id, &context);
                    last_state = context.state;
                }

                let terminal = context.state.is_terminal();
                if terminal {
                    guard.release().await;
                }
                if terminal || state_changed || content.len() != last_content_len {
                    last_content_len = content.len();
                    yield PartialMessage {
                        session_id: session_id.clone(),
                        message_id: message_id.clone(),
                        content,
                        is_streaming: !terminal,
                        is_error: context.state == StreamingState::Error,
                        state: context.state,
                    };
                }

                if terminal {
                    info!(
                        session_id = %session_id,
                        state = context.state.as_str(),
                        tools = context.tools_executed_count,
                        events = context.event_count,
                        "Streaming finished"
                    );
                    return;
                }
            }
        }
    }

    /// Drop the streaming context of a closed session.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        self.registry.remove(session_id).await
    }

    pub async fn state(&self, session_id: &str) -> Option<StreamingState> {
        self.registry.state(session_id).await
    }

    fn publish_progress(&self, session_id: &str, context: &SessionStreamingContext) {
        self.events.publish(CoreEvent::StreamingProgressChanged {
            session_id: session_id.to_string(),
            state: context.state,
            current_tool_name: context.current_tool_name.clone(),
            tools_executed_count: context.tools_executed_count,
            event_count: context.event_count,
        });
    }
}

/// Releases the session's turn. Every normal exit releases it explicitly
/// before the last message; the drop path covers consumers that drop the
/// stream early.
struct TurnGuard {
    turn: TurnHandle,
    delivery: Option<AbortHandle>,
    released: bool,
}

impl TurnGuard {
    async fn release(&mut self) {
        self.turn.lock().await.active = false;
        self.released = true;
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Some(delivery) = &self.delivery {
            delivery.abort();
        }
        if self.released {
            return;
        }
        if let Ok(mut t) = self.turn.try_lock() {
            t.active = false;
        } else if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let turn = Arc::clone(&self.turn);
            runtime.spawn(async move {
                turn.lock().await.active = false;
            });
        }
    }
}

/// Apply backend events to the turn in delivery order.
async fn deliver_events(
    mut rx: mpsc::Receiver<BackendEvent>,
    turn: TurnHandle,
    events: EventBus,
    session_id: String,
) {
    while let Some(event) = rx.recv().await {
        publish_observed(&events, &session_id, &event);

        let mut t = turn.lock().await;
        if t.context.state.is_terminal() {
            debug!(session_id = %session_id, ?event, "Dropping event after terminal state");
            return;
        }
        if let BackendEvent::ContentDelta { text } = &event {
            t.content.push_str(text);
        }
        if let BackendEvent::SessionError { message } = &event {
            warn!(session_id = %session_id, error = %message, "Backend reported an error");
            if !message.is_empty() {
                t.content.push_str(&format!("\n\n[Error: {message}]"));
            }
        }
        t.context.apply(&event);
        if t.context.state.is_terminal() {
            return;
        }
    }

    let mut t = turn.lock().await;
    if !t.context.state.is_terminal() {
        warn!(session_id = %session_id, "Event stream closed before the session went idle");
        t.content.push_str(STREAM_CLOSED_NOTICE);
        t.context.transition(StreamingState::Error);
    }
}

/// Mirror tool and reasoning activity onto the event bus.
fn publish_observed(events: &EventBus, session_id: &str, event: &BackendEvent) {
    let observed = match event {
        BackendEvent::ToolStart {
            tool_call_id,
            tool_name,
            arguments,
        } => CoreEvent::ToolExecutionStarted {
            session_id: session_id.to_string(),
            tool_call_id: tool_call_id.clone(),
            tool_name: tool_name.clone(),
            arguments: arguments.clone(),
        },
        BackendEvent::ToolComplete {
            tool_call_id,
            success,
            output,
        } => CoreEvent::ToolExecutionCompleted {
            session_id: session_id.to_string(),
            tool_call_id: tool_call_id.clone(),
            success: *success,
            output: output.clone(),
        },
        BackendEvent::Reasoning { text } => CoreEvent::ReasoningObserved {
            session_id: session_id.to_string(),
            text: text.clone(),
        },
        _ => return,
    };
    events.publish(observed);
}

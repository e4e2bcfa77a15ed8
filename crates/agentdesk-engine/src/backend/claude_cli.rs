//! Claude Code CLI backend.
//!
//! One `claude` process per backend session, speaking stream-json on stdin
//! and stdout. Permission checks arrive as `can_use_tool` control requests
//! and are answered through the session's [`ToolHooks`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use agentdesk_core::ndjson::{self, ControlRequest, ControlRequestType, Message};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bridge::{self, MessageBridge};
use super::{
    AgentBackend, BackendConnector, BackendError, BackendEvent, BackendSession,
    BackendSessionConfig, HookDecision, ToolHooks, ToolUse,
};

const TURN_CHANNEL_CAPACITY: usize = 256;

/// How long a resumed process must stay up to count as resumed. The CLI
/// exits right after startup when it does not know the resume token.
const DEFAULT_RESUME_GRACE: Duration = Duration::from_millis(1500);

/// Sender for the turn currently consuming events, if any.
type TurnSlot = Arc<Mutex<Option<mpsc::Sender<BackendEvent>>>>;

/// Verifies the CLI is installed and hands out a [`ClaudeCliBackend`].
#[derive(Debug, Clone)]
pub struct ClaudeCliConnector {
    cli_bin: PathBuf,
    terminate_timeout: Duration,
    resume_grace: Duration,
}

impl ClaudeCliConnector {
    pub fn new(cli_bin: impl Into<PathBuf>, terminate_timeout: Duration) -> Self {
        Self {
            cli_bin: cli_bin.into(),
            terminate_timeout,
            resume_grace: DEFAULT_RESUME_GRACE,
        }
    }

    #[must_use]
    pub const fn with_resume_grace(mut self, grace: Duration) -> Self {
        self.resume_grace = grace;
        self
    }
}

#[async_trait]
impl BackendConnector for ClaudeCliConnector {
    async fn connect(&self) -> Result<Arc<dyn AgentBackend>, BackendError> {
        let output = Command::new(&self.cli_bin)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackendError::Unavailable {
                reason: format!("{}: {e}", self.cli_bin.display()),
            })?;

        if !output.status.success() {
            return Err(BackendError::Unavailable {
                reason: format!(
                    "{} --version exited with {}",
                    self.cli_bin.display(),
                    output.status
                ),
            });
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(cli = %self.cli_bin.display(), version, "Connected to Claude CLI");

        Ok(Arc::new(
            ClaudeCliBackend::new(self.cli_bin.clone(), self.terminate_timeout)
                .with_resume_grace(self.resume_grace),
        ))
    }
}

struct CliProcess {
    child: Mutex<Child>,
    stdin_tx: mpsc::Sender<String>,
    turn: TurnSlot,
    working_directory: PathBuf,
    /// Fired when stdout closes, i.e. the process is gone.
    exited: CancellationToken,
    /// Fired on the first `system`/`init`.
    initialized: CancellationToken,
}

/// Backend driving Claude Code subprocesses.
pub struct ClaudeCliBackend {
    cli_bin: PathBuf,
    terminate_timeout: Duration,
    resume_grace: Duration,
    processes: RwLock<HashMap<String, Arc<CliProcess>>>,
}

impl ClaudeCliBackend {
    pub fn new(cli_bin: PathBuf, terminate_timeout: Duration) -> Self {
        Self {
            cli_bin,
            terminate_timeout,
            resume_grace: DEFAULT_RESUME_GRACE,
            processes: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn with_resume_grace(mut self, grace: Duration) -> Self {
        self.resume_grace = grace;
        self
    }

    pub async fn active_count(&self) -> usize {
        self.processes.read().await.len()
    }

    async fn process(&self, id: &str) -> Result<Arc<CliProcess>, BackendError> {
        self.processes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::SessionNotFound { id: id.to_string() })
    }

    fn build_command(&self, config: &BackendSessionConfig, working_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.cli_bin);
        cmd.current_dir(working_dir)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--permission-prompt-tool")
            .arg("stdio")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref model) = config.model {
            cmd.arg("--model").arg(model);
        }
        for server in &config.mcp_servers {
            cmd.arg("--mcp-config").arg(server);
        }
        if !config.enabled_tools.is_empty() {
            debug!(
                session_id = %config.session_id,
                tools = ?config.enabled_tools,
                "Tool restrictions are enforced by the approval gate"
            );
        }
        cmd
    }

    #[allow(clippy::too_many_lines)]
    async fn spawn(
        &self,
        config: BackendSessionConfig,
        resume_token: Option<&str>,
    ) -> Result<BackendSession, BackendError> {
        let working_dir = if config.working_directory.as_os_str().is_empty()
            || !config.working_directory.exists()
        {
            let fallback = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
            warn!(
                requested = %config.working_directory.display(),
                fallback = %fallback.display(),
                "Working directory missing or empty, using fallback"
            );
            fallback
        } else {
            config.working_directory.clone()
        };

        let mut cmd = self.build_command(&config, &working_dir);
        let token = match resume_token {
            Some(token) => {
                cmd.arg("--resume").arg(token);
                token.to_string()
            }
            None => {
                let token = uuid::Uuid::new_v4().to_string();
                cmd.arg("--session-id").arg(&token);
                token
            }
        };

        info!(
            session_id = %config.session_id,
            working_dir = %working_dir.display(),
            resume = resume_token.is_some(),
            model = ?config.model,
            "Spawning claude subprocess"
        );
        let mut child = cmd.spawn().map_err(|e| BackendError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let process_id = uuid::Uuid::new_v4().to_string();

        let stdin = child.stdin.take().ok_or_else(|| BackendError::SpawnFailed {
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
        let pid = process_id.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    error!(process_id = %pid, error = %e, "Failed to write to stdin");
                    break;
                }
            }
        });

        if let Some(stderr) = child.stderr.take() {
            let pid = process_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(process_id = %pid, "stderr: {}", line);
                }
                debug!(process_id = %pid, "stderr reader finished");
            });
        }

        let turn: TurnSlot = Arc::new(Mutex::new(None));
        let exited = CancellationToken::new();
        let initialized = CancellationToken::new();
        tokio::spawn(read_stdout(
            StdoutReader {
                process_id: process_id.clone(),
                stdin_tx: stdin_tx.clone(),
                turn: Arc::clone(&turn),
                hooks: Arc::clone(&config.hooks),
                exited: exited.clone(),
                initialized: initialized.clone(),
            },
            stdout,
        ));

        let process = CliProcess {
            child: Mutex::new(child),
            stdin_tx,
            turn,
            working_directory: working_dir,
            exited,
            initialized,
        };
        self.processes
            .write()
            .await
            .insert(process_id.clone(), Arc::new(process));

        Ok(BackendSession {
            id: process_id,
            resume_token: Some(token),
        })
    }

    /// Fail the resume if the process dies before `init` or within the
    /// grace period.
    async fn confirm_resume(&self, session: &BackendSession) -> Result<(), BackendError> {
        let process = self.process(&session.id).await?;
        let died = tokio::select! {
            biased;
            () = process.exited.cancelled() => true,
            () = process.initialized.cancelled() => false,
            () = tokio::time::sleep(self.resume_grace) => false,
        };
        if !died {
            return Ok(());
        }

        warn!(process_id = %session.id, "Claude exited while resuming");
        self.processes.write().await.remove(&session.id);
        self.terminate(&session.id, &process).await;
        Err(BackendError::ResumeFailed {
            reason: "claude exited before the session was resumed".to_string(),
        })
    }

    async fn terminate(&self, process_id: &str, process: &CliProcess) {
        let mut child = process.child.lock().await;
        debug!(
            process_id,
            working_dir = %process.working_directory.display(),
            "Terminating subprocess"
        );

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: pid comes from our own Child handle; SIGINT to an
                // owned subprocess has no memory-safety implications.
                #[allow(unsafe_code)]
                #[allow(clippy::cast_possible_wrap)]
                let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
                if ret != 0 {
                    let err = std::io::Error::last_os_error();
                    warn!(process_id, pid, error = %err, "Failed to send SIGINT");
                }
            }
        }

        match tokio::time::timeout(self.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => info!(process_id, ?status, "Process exited gracefully"),
            Ok(Err(e)) => {
                warn!(process_id, error = %e, "Error waiting for process");
                child.kill().await.ok();
            }
            Err(_) => {
                warn!(process_id, "Timeout waiting for graceful shutdown, killing");
                child.kill().await.ok();
            }
        }
    }
}

#[async_trait]
impl AgentBackend for ClaudeCliBackend {
    async fn start_session(
        &self,
        config: BackendSessionConfig,
    ) -> Result<BackendSession, BackendError> {
        self.spawn(config, None).await
    }

    async fn resume_session(
        &self,
        resume_token: &str,
        config: BackendSessionConfig,
    ) -> Result<BackendSession, BackendError> {
        if resume_token.trim().is_empty() {
            return Err(BackendError::ResumeFailed {
                reason: "empty resume token".to_string(),
            });
        }
        let session = self.spawn(config, Some(resume_token)).await?;
        self.confirm_resume(&session).await?;
        Ok(session)
    }

    async fn send_prompt(
        &self,
        session: &BackendSession,
        prompt: &str,
    ) -> Result<mpsc::Receiver<BackendEvent>, BackendError> {
        let process = self.process(&session.id).await?;
        let (tx, rx) = mpsc::channel(TURN_CHANNEL_CAPACITY);
        {
            let mut slot = process.turn.lock().await;
            // The reader fires `exited` before it drains the slot, so a check
            // under the slot lock cannot miss the exit.
            if process.exited.is_cancelled() {
                return Err(BackendError::ProcessExited {
                    id: session.id.clone(),
                });
            }
            if slot.as_ref().is_some_and(|s| !s.is_closed()) {
                return Err(BackendError::Busy {
                    id: session.id.clone(),
                });
            }
            *slot = Some(tx);
        }

        if process
            .stdin_tx
            .send(bridge::user_message_json(prompt))
            .await
            .is_err()
        {
            process.turn.lock().await.take();
            return Err(BackendError::ProcessExited {
                id: session.id.clone(),
            });
        }
        Ok(rx)
    }

    async fn abort(&self, session: &BackendSession) -> Result<(), BackendError> {
        let process = self.process(&session.id).await?;
        if process.exited.is_cancelled() {
            return Err(BackendError::ProcessExited {
                id: session.id.clone(),
            });
        }
        let request_id = format!("interrupt_{}", uuid::Uuid::new_v4());
        process
            .stdin_tx
            .send(bridge::interrupt_request_json(&request_id))
            .await
            .map_err(|_| BackendError::ProcessExited {
                id: session.id.clone(),
            })?;
        debug!(process_id = %session.id, request_id, "Sent interrupt");
        Ok(())
    }

    async fn dispose(&self, session: &BackendSession) -> Result<(), BackendError> {
        let process = self
            .processes
            .write()
            .await
            .remove(&session.id)
            .ok_or_else(|| BackendError::SessionNotFound {
                id: session.id.clone(),
            })?;
        process.turn.lock().await.take();
        self.terminate(&session.id, &process).await;
        Ok(())
    }
}

/// Per-process state the stdout reader works with.
struct StdoutReader {
    process_id: String,
    stdin_tx: mpsc::Sender<String>,
    turn: TurnSlot,
    hooks: Arc<dyn ToolHooks>,
    exited: CancellationToken,
    initialized: CancellationToken,
}

/// Read NDJSON from stdout, answer permission requests, forward events to
/// the active turn.
async fn read_stdout(reader: StdoutReader, stdout: ChildStdout) {
    let StdoutReader {
        process_id,
        stdin_tx,
        turn,
        hooks,
        exited,
        initialized,
    } = reader;
    let mut bridge = MessageBridge::new();
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let msg = match ndjson::parse_line(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(process_id = %process_id, error = %e, "Skipping unparsable line");
                continue;
            }
        };

        match msg {
            Message::ControlRequest(req) => {
                answer_control_request(&process_id, req, &stdin_tx, &hooks);
                continue;
            }
            Message::SystemInit(_) => initialized.cancel(),
            _ => {}
        }

        for event in bridge.convert(msg) {
            match &event {
                BackendEvent::ToolComplete {
                    tool_call_id,
                    success,
                    ..
                } => hooks.post_tool_use(tool_call_id, *success).await,
                BackendEvent::SessionError { message } => hooks.on_error(message).await,
                _ => {}
            }
            let ends_turn = matches!(
                event,
                BackendEvent::SessionIdle | BackendEvent::SessionError { .. }
            );
            let mut slot = turn.lock().await;
            let delivered = match slot.as_ref() {
                Some(tx) => tx.send(event).await.is_ok(),
                None => true,
            };
            if !delivered {
                debug!(process_id = %process_id, "Turn receiver dropped");
            }
            if !delivered || ends_turn {
                slot.take();
            }
        }
    }

    info!(process_id = %process_id, "stdout reader finished");
    exited.cancel();
    if let Some(tx) = turn.lock().await.take() {
        let _ = tx
            .send(BackendEvent::SessionError {
                message: "Claude process exited".to_string(),
            })
            .await;
    }
}

/// Run the pre-tool-use hook off the reader task and write the response.
fn answer_control_request(
    process_id: &str,
    req: ControlRequest,
    stdin_tx: &mpsc::Sender<String>,
    hooks: &Arc<dyn ToolHooks>,
) {
    let ControlRequestType::CanUseTool {
        tool_name,
        input,
        tool_use_id,
    } = req.request
    else {
        debug!(process_id, request_id = %req.request_id, "Ignoring unsupported control request");
        return;
    };

    let hooks = Arc::clone(hooks);
    let stdin_tx = stdin_tx.clone();
    let process_id = process_id.to_string();
    tokio::spawn(async move {
        let tool = ToolUse {
            tool_name,
            arguments: input,
            tool_call_id: tool_use_id,
        };
        let decision = hooks.pre_tool_use(&tool).await;
        let deny_reason = match &decision {
            HookDecision::Allow => None,
            HookDecision::Deny { reason } => Some(reason.as_str()),
        };
        let line = bridge::permission_response_json(&req.request_id, deny_reason, &tool.arguments);
        if stdin_tx.send(line).await.is_err() {
            warn!(process_id = %process_id, request_id = %req.request_id, "Process gone before permission response");
        }
    });
}

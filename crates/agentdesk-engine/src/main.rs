//! `AgentDesk` command-line driver.
//!
//! Streams a single prompt or runs an iterative task against the Claude Code
//! CLI, answering tool approval prompts on the console.
//! User-facing output uses writeln! to stdout/stderr (this is a CLI binary,
//! not debug output).

use std::io::{self, Write};
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agentdesk_core::RuleScope;
use agentdesk_engine::approval::{ApprovalGate, ApprovalPrompt, ApprovalResponse};
use agentdesk_engine::iteration::TaskStatus;
use agentdesk_engine::{AutonomyFlags, CoreEvent, Orchestrator, Session};

#[derive(Parser, Debug)]
#[command(name = "agentdesk")]
#[command(version, about = "AgentDesk - drive a coding agent with tool approvals")]
struct Args {
    /// Project directory (working directory of the agent and root of
    /// `.agentdesk/settings.json`)
    #[arg(short = 'd', long, env = "AGENTDESK_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Session ID (a new one is generated if not specified)
    #[arg(short, long, env = "AGENTDESK_SESSION")]
    session: Option<String>,

    /// Resume token of an earlier backend session
    #[arg(long)]
    resume: Option<String>,

    /// Model to use (e.g., "claude-sonnet-4")
    #[arg(short, long, env = "AGENTDESK_MODEL")]
    model: Option<String>,

    /// Path to the `claude` CLI binary
    #[arg(long, env = "AGENTDESK_CLAUDE_BIN")]
    claude_bin: Option<PathBuf>,

    /// Approve every tool call without asking
    #[arg(long)]
    allow_all: bool,

    /// Answer approval prompts with "allow once" instead of asking
    #[arg(long)]
    yes: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "warn", env = "AGENTDESK_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "AGENTDESK_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one prompt and stream the response
    Prompt {
        /// Prompt text
        text: String,
    },
    /// Iterate on a task until its success criteria are met
    Task {
        /// What the agent should do
        description: String,

        /// How to tell the task is done
        #[arg(short, long)]
        criteria: String,

        /// Iteration limit (defaults to the configured value)
        #[arg(long)]
        max_iterations: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("agentdesk_engine={0},agentdesk_core={0}", args.log_level);
    agentdesk_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let project_dir = match args.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let mut config = agentdesk_core::config::load_config(Some(&project_dir))?;
    if let Some(bin) = &args.claude_bin {
        config.backend.cli_bin.clone_from(bin);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        project_dir = %project_dir.display(),
        cli_bin = %config.backend.cli_bin.display(),
        "Starting agentdesk"
    );

    let orchestrator = Orchestrator::from_config(&config, Some(project_dir.clone()));
    let shutdown = CancellationToken::new();
    let maintenance = orchestrator.spawn_maintenance(shutdown.clone());
    let approvals = tokio::spawn(answer_approvals(
        Arc::clone(&orchestrator.gate),
        args.yes,
        shutdown.clone(),
    ));

    let session_id = args
        .session
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut session = Session::new(session_id.clone(), project_dir);
    if let Some(model) = &args.model {
        session = session.with_model(model.clone());
    }
    if let Some(token) = &args.resume {
        session = session.with_resume_token(token.clone());
    }
    if args.allow_all {
        session = session.with_autonomy(AutonomyFlags::full());
    }
    let session = session.shared();

    let outcome = match args.command {
        Command::Prompt { text } => run_prompt(&orchestrator, &session, text).await,
        Command::Task {
            description,
            criteria,
            max_iterations,
        } => run_task(&orchestrator, &session, description, criteria, max_iterations).await,
    };

    if let Some(token) = session.read().await.external_session_handle.clone() {
        writeln!(io::stderr(), "[Resume with --resume {token}]")?;
    }
    orchestrator.close_session(&session_id).await;
    shutdown.cancel();
    approvals.abort();
    let _ = maintenance.await;
    outcome
}

async fn run_prompt(
    orchestrator: &Orchestrator,
    session: &agentdesk_engine::SharedSession,
    text: String,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel_on_ctrl_c(cancel.clone());

    let mut stream = pin!(
        orchestrator
            .streaming
            .start_streaming(Arc::clone(session), text, cancel)
    );
    let mut out = io::stdout();
    let mut printed = 0usize;
    let mut failed = false;
    while let Some(message) = stream.next().await {
        if let Some(new) = message.content.get(printed..) {
            write!(out, "{new}")?;
            out.flush()?;
        }
        printed = message.content.len();
        if !message.is_streaming {
            writeln!(out)?;
            writeln!(io::stderr(), "[{}]", message.state.as_str())?;
            failed = message.is_error;
        }
    }
    ctrl_c.abort();

    if failed {
        anyhow::bail!("the agent turn ended with an error");
    }
    Ok(())
}

async fn run_task(
    orchestrator: &Orchestrator,
    session: &agentdesk_engine::SharedSession,
    description: String,
    criteria: String,
    max_iterations: Option<u32>,
) -> anyhow::Result<()> {
    let session_id = session.read().await.session_id.clone();
    orchestrator
        .iteration
        .configure_task(&session_id, description, criteria, max_iterations)
        .await?;

    let mut events = orchestrator.events.subscribe();
    let mut handle = orchestrator.iteration.start_task(Arc::clone(session)).await?;
    let mut err = io::stderr();

    let status = loop {
        tokio::select! {
            joined = &mut handle => break joined?,
            _ = tokio::signal::ctrl_c() => {
                writeln!(err, "[Stopping task]")?;
                orchestrator.iteration.stop_task(&session_id).await;
            }
            event = events.recv() => match event {
                Ok(CoreEvent::IterationCompleted { session_id: sid, result }) if sid == session_id => {
                    writeln!(
                        err,
                        "[Iteration {}: {:?}, {} tool call(s)]",
                        result.iteration_number,
                        result.status,
                        result.tool_executions.len()
                    )?;
                    if let Some(evaluation) = &result.evaluation {
                        writeln!(err, "  {}", evaluation.summary)?;
                    }
                }
                Ok(CoreEvent::ToolExecutionStarted { session_id: sid, tool_name, .. }) if sid == session_id => {
                    writeln!(err, "[Tool: {tool_name}]")?;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event display fell behind"),
                Err(RecvError::Closed) => {}
            },
        }
    };

    writeln!(io::stdout(), "Task finished: {}", status.as_str())?;
    if let Some(task) = orchestrator.iteration.task(&session_id).await
        && let Some(last) = task.state.iterations.last()
    {
        writeln!(io::stdout(), "{}", last.result_text)?;
    }
    match status {
        TaskStatus::Completed | TaskStatus::Stopped => Ok(()),
        other => anyhow::bail!("task ended as {}", other.as_str()),
    }
}

/// Cancel `token` on the first Ctrl+C.
fn cancel_on_ctrl_c(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}

/// Answer approval prompts from the console until `shutdown` fires.
async fn answer_approvals(gate: Arc<ApprovalGate>, auto_accept: bool, shutdown: CancellationToken) {
    let mut prompts = gate.subscribe_requests();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let prompt = tokio::select! {
            () = shutdown.cancelled() => return,
            prompt = prompts.recv() => match prompt {
                Ok(prompt) => prompt,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed approval prompts");
                    continue;
                }
                Err(RecvError::Closed) => return,
            },
        };

        let response = if auto_accept {
            let _ = writeln!(
                io::stderr(),
                "[Auto-accepting: {} - {}]",
                prompt.request.tool_name,
                prompt.request.description
            );
            ApprovalResponse::allow()
        } else {
            let _ = show_prompt(&prompt);
            match stdin.next_line().await {
                Ok(Some(line)) => parse_answer(&line),
                Ok(None) | Err(_) => ApprovalResponse::deny("no answer on stdin"),
            }
        };

        if !gate.resolve(&prompt.request_id, response).await {
            warn!(request_id = %prompt.request_id, "Approval prompt expired before the answer");
        }
    }
}

fn show_prompt(prompt: &ApprovalPrompt) -> io::Result<()> {
    let mut err = io::stderr();
    writeln!(
        err,
        "\n[Approval needed: {} ({:?} risk)]",
        prompt.request.tool_name, prompt.request.risk_level
    )?;
    writeln!(err, "  {}", prompt.request.description)?;
    write!(err, "  Allow? [y]es / [N]o / [s]ession / [g]lobal: ")?;
    err.flush()
}

/// Map a console answer to a response. Anything unrecognized is a deny.
fn parse_answer(line: &str) -> ApprovalResponse {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalResponse::allow(),
        "s" | "session" => ApprovalResponse::allow().remembered(RuleScope::Session),
        "g" | "global" => ApprovalResponse::allow().remembered(RuleScope::Global),
        _ => ApprovalResponse::deny("denied on the console"),
    }
}

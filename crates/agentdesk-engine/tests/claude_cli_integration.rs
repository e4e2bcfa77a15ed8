#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity
#![cfg(unix)]

//! Claude CLI backend against a shell script speaking the stream-json protocol.

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agentdesk_core::Config;
use agentdesk_core::rules::MemoryRuleRepository;
use agentdesk_engine::backend::ClaudeCliConnector;
use agentdesk_engine::streaming::{StaticSettingsProvider, StreamingState};
use agentdesk_engine::{Orchestrator, Session, SharedSession};
use common::{collect, fast_settings};
use tokio_util::sync::CancellationToken;

const FAKE_CLAUDE: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "0.0.0 (fake)"
  exit 0
fi
prev=""
for arg in "$@"; do
  if [ "$prev" = "--resume" ] && [ "$arg" = "@REJECT@" ]; then
    echo "No conversation found with session ID: $arg" >&2
    exit 1
  fi
  prev="$arg"
done
while IFS= read -r line; do
  echo '{"type":"system","subtype":"init","session_id":"fake","model":"m","cwd":"/tmp","tools":[]}'
  echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}],"stop_reason":"end_turn"}}'
  echo '{"type":"result","subtype":"success","is_error":false,"session_id":"fake","result":"hello"}'
  if [ "@ONE_SHOT@" = "yes" ]; then
    exit 0
  fi
done
"#;

fn write_fake_claude(dir: &Path, reject: &str, one_shot: bool) -> PathBuf {
    let path = dir.join("claude");
    let script = FAKE_CLAUDE
        .replace("@REJECT@", reject)
        .replace("@ONE_SHOT@", if one_shot { "yes" } else { "no" });
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn cli_orchestrator(cli: PathBuf) -> Orchestrator {
    let connector = ClaudeCliConnector::new(cli, Duration::from_secs(2))
        .with_resume_grace(Duration::from_millis(300));
    Orchestrator::new(
        &Config::default(),
        Arc::new(connector),
        Arc::new(MemoryRuleRepository::new()),
        Arc::new(StaticSettingsProvider(fast_settings())),
    )
}

async fn ask(orch: &Orchestrator, session: &SharedSession, prompt: &str) -> (StreamingState, String) {
    let messages = tokio::time::timeout(
        Duration::from_secs(10),
        collect(orch.streaming.start_streaming(
            Arc::clone(session),
            prompt.into(),
            CancellationToken::new(),
        )),
    )
    .await
    .unwrap();
    let last = messages.last().unwrap();
    (last.state, last.content.clone())
}

#[tokio::test]
async fn stale_resume_token_falls_back_to_new_session() {
    let dir = tempfile::tempdir().unwrap();
    let orch = cli_orchestrator(write_fake_claude(dir.path(), "stale", false));
    let session = Session::new("s1", "/tmp")
        .with_resume_token("stale")
        .shared();

    let (state, content) = ask(&orch, &session, "hi").await;
    assert_eq!(state, StreamingState::Completed);
    assert_eq!(content, "hello");

    let token = session.read().await.external_session_handle.clone().unwrap();
    assert_ne!(token, "stale");
}

#[tokio::test]
async fn exited_process_is_replaced_on_next_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let orch = cli_orchestrator(write_fake_claude(dir.path(), "none", true));
    let session = Session::new("s1", "/tmp").shared();

    let (state, _) = ask(&orch, &session, "one").await;
    assert_eq!(state, StreamingState::Completed);
    let token = session.read().await.external_session_handle.clone();

    // Let the one-shot process exit before the next turn.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (state, content) = ask(&orch, &session, "two").await;
    assert_eq!(state, StreamingState::Completed);
    assert_eq!(content, "hello");
    assert_eq!(session.read().await.external_session_handle, token);
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end tests for the session orchestrator.
//!
//! Each test writes a small `/bin/sh` stand-in for the agent CLI that prints
//! scripted NDJSON, then drives a real orchestrator against it.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use grove_agent::orchestrator::NO_RESPONSE_TEXT;
use grove_agent::{
	GitWorktreeRegistry, MessageRole, OrchestratorConfig, OrchestratorError, SessionErrorKind,
	SessionEvent, SessionOrchestrator, SessionPhase, StaticWorktreeRegistry, ToolCallStatus,
	TurnOutcome,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
	_bin: TempDir,
	worktree: TempDir,
	orchestrator: Arc<SessionOrchestrator>,
}

impl Harness {
	/// Orchestrator with session `w1` on a fresh worktree, running `body` as
	/// the agent.
	async fn new(body: &str) -> Self {
		let bin = TempDir::new().unwrap();
		let agent = write_agent(bin.path(), body);
		let worktree = TempDir::new().unwrap();

		let config = OrchestratorConfig {
			binary_candidates: vec![agent],
			shutdown_grace_ms: 500,
			..Default::default()
		};
		let registry = StaticWorktreeRegistry::new([worktree.path().to_path_buf()]);
		let orchestrator = Arc::new(SessionOrchestrator::new(config, Arc::new(registry)));
		orchestrator
			.create_session("w1", worktree.path().to_str().unwrap())
			.await
			.unwrap();

		Self {
			_bin: bin,
			worktree,
			orchestrator,
		}
	}

	fn worktree_path(&self) -> PathBuf {
		self.worktree.path().canonicalize().unwrap()
	}
}

fn write_agent(dir: &Path, body: &str) -> PathBuf {
	let path = dir.join("claude");
	std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
	std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
	path
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
	F: FnMut(&SessionEvent) -> bool,
{
	tokio::time::timeout(EVENT_TIMEOUT, async {
		loop {
			let event = rx.recv().await.unwrap();
			if pred(&event) {
				return event;
			}
		}
	})
	.await
	.expect("timed out waiting for event")
}

/// Test: a successful result leaves streamed text untouched.
///
/// Why this test is important: the success path must not rewrite what the
/// user already saw, and must always end non-streaming and idle.
#[tokio::test]
async fn test_success_keeps_streamed_text() {
	let harness = Harness::new(
		r#"cat <<'EOF'
{"type":"system","subtype":"init","session_id":"s1"}
{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}
{"type":"assistant","message":{"content":[{"type":"text","text":", world"}]}}
{"type":"result","subtype":"success","result":"Hello, world","total_cost_usd":0.01,"num_turns":1,"duration_ms":120,"usage":{"input_tokens":10,"output_tokens":5}}
EOF"#,
	)
	.await;

	let outcome = harness.orchestrator.send_message("w1", "say hello").await.unwrap();
	assert_eq!(outcome, TurnOutcome::Completed);

	let snapshot = harness.orchestrator.snapshot("w1").await.unwrap();
	assert!(!snapshot.is_processing);
	assert_eq!(snapshot.phase, SessionPhase::Idle);
	assert!(snapshot.last_error.is_none());
	assert!(snapshot.current_assistant_message_id.is_none());
	assert_eq!(snapshot.messages.len(), 2);
	assert_eq!(snapshot.messages[0].role, MessageRole::User);
	assert_eq!(snapshot.messages[0].content, "say hello");

	let reply = &snapshot.messages[1];
	assert_eq!(reply.role, MessageRole::Assistant);
	assert_eq!(reply.content, "Hello, world");
	assert!(!reply.is_streaming);
	assert_eq!(snapshot.usage.input_tokens, 10);
	assert_eq!(snapshot.usage.output_tokens, 5);
	assert_eq!(snapshot.usage.last_duration_ms, Some(120));
}

/// Test: usage accumulates across turns, duration is last-turn-wins.
///
/// Why this test is important: usage must be monotonically non-decreasing
/// over a session's lifetime.
#[tokio::test]
async fn test_usage_accumulates_over_two_turns() {
	let harness = Harness::new(
		r#"if [ -f .second-turn ]; then
cat <<'EOF'
{"type":"assistant","message":{"content":[{"type":"text","text":"two"}]}}
{"type":"result","subtype":"success","num_turns":2,"duration_ms":40,"usage":{"input_tokens":3,"output_tokens":7}}
EOF
else
touch .second-turn
cat <<'EOF'
{"type":"assistant","message":{"content":[{"type":"text","text":"one"}]}}
{"type":"result","subtype":"success","num_turns":1,"duration_ms":100,"usage":{"input_tokens":10,"output_tokens":5}}
EOF
fi"#,
	)
	.await;

	for prompt in ["first", "second"] {
		let outcome = harness.orchestrator.send_message("w1", prompt).await.unwrap();
		assert_eq!(outcome, TurnOutcome::Completed);
	}

	let snapshot = harness.orchestrator.snapshot("w1").await.unwrap();
	assert_eq!(snapshot.usage.input_tokens, 13);
	assert_eq!(snapshot.usage.output_tokens, 12);
	assert_eq!(snapshot.usage.total_turns, 3);
	assert_eq!(snapshot.usage.last_duration_ms, Some(40));
	let replies: Vec<_> = snapshot
		.messages
		.iter()
		.filter(|m| m.role == MessageRole::Assistant)
		.map(|m| m.content.as_str())
		.collect();
	assert_eq!(replies, vec!["one", "two"]);
}

/// Test: a tool result completes the tool call with the same id.
///
/// Why this test is important: ids must be carried verbatim from invocation
/// to result, and array content joins its text blocks with newlines.
#[tokio::test]
async fn test_tool_call_correlation() {
	let harness = Harness::new(
		r#"cat <<'EOF'
{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"src/lib.rs"}}]}}
{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}]}}
{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"late duplicate"}]}}
{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"nope","content":"unknown"}]}}
{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}
{"type":"result","subtype":"success"}
EOF"#,
	)
	.await;
	let mut events = harness.orchestrator.subscribe();

	let outcome = harness.orchestrator.send_message("w1", "read it").await.unwrap();
	assert_eq!(outcome, TurnOutcome::Completed);

	let snapshot = harness.orchestrator.snapshot("w1").await.unwrap();
	let reply = &snapshot.messages[1];
	assert_eq!(reply.content, "done");
	assert_eq!(reply.tool_calls.len(), 1);
	let call = &reply.tool_calls[0];
	assert_eq!(call.id, "t1");
	assert_eq!(call.name, "Read");
	assert_eq!(call.input["file_path"], "src/lib.rs");
	assert_eq!(call.status, ToolCallStatus::Completed);
	assert_eq!(call.output.as_deref(), Some("a\nb"));

	let started = next_matching(&mut events, |e| matches!(e, SessionEvent::ToolCallUpdated { .. })).await;
	let SessionEvent::ToolCallUpdated { tool_call, message_id, .. } = started else {
		unreachable!();
	};
	assert_eq!(tool_call.status, ToolCallStatus::Running);
	assert_eq!(message_id, reply.id);
}

/// Test: an error result is shown inline and recorded as the last error.
///
/// Why this test is important: the user must see the failure in the reply
/// itself, not just in a side channel.
#[tokio::test]
async fn test_agent_error_result_is_appended() {
	let harness = Harness::new(
		r#"cat <<'EOF'
{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}
{"type":"result","subtype":"error_during_execution","is_error":true,"result":"it broke","num_turns":1}
EOF"#,
	)
	.await;

	let outcome = harness.orchestrator.send_message("w1", "go").await.unwrap();
	let error = outcome.error().cloned().unwrap();
	assert_eq!(error.kind, SessionErrorKind::Agent);
	assert_eq!(error.message, "it broke");

	let snapshot = harness.orchestrator.snapshot("w1").await.unwrap();
	assert_eq!(snapshot.messages[1].content, "partial\n\nit broke");
	assert!(!snapshot.messages[1].is_streaming);
	assert_eq!(snapshot.phase, SessionPhase::Idle);
	assert_eq!(snapshot.last_error, Some(error));
	assert_eq!(snapshot.usage.total_turns, 1);
}

/// Test: a non-zero exit without a result finalizes with an error.
///
/// Why this test is important: a process that dies mid-stream must never
/// leave a message streaming forever.
#[tokio::test]
async fn test_abnormal_exit_is_finalized() {
	let harness = Harness::new(
		r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}'
echo 'segfault in module' >&2
exit 3"#,
	)
	.await;
	let mut events = harness.orchestrator.subscribe();

	let outcome = harness.orchestrator.send_message("w1", "go").await.unwrap();
	let error = outcome.error().cloned().unwrap();
	assert_eq!(error.kind, SessionErrorKind::AbnormalTermination);
	assert!(error.message.contains("segfault in module"));

	let status = harness.orchestrator.get_session_status("w1").await;
	assert!(status.active);
	assert!(!status.processing);
	assert_eq!(status.phase, SessionPhase::Disconnected);
	assert_eq!(status.last_error, Some(error.clone()));

	let snapshot = harness.orchestrator.snapshot("w1").await.unwrap();
	let reply = &snapshot.messages[1];
	assert!(reply.content.starts_with("Hello\n\nAgent process failed"));
	assert!(!reply.is_streaming);

	let reported = next_matching(&mut events, |e| matches!(e, SessionEvent::SessionError { .. })).await;
	assert_eq!(
		reported,
		SessionEvent::SessionError {
			worktree_id: "w1".to_string(),
			error,
		}
	);
}

/// Test: a recognised stderr auth failure short-circuits the turn.
///
/// Why this test is important: an unauthenticated agent may hang waiting for
/// login; the user needs remediation text instead of a stuck spinner.
#[tokio::test]
async fn test_auth_failure_on_stderr() {
	let harness = Harness::new("echo 'Error: Not authenticated. Please log in.' >&2\nexec sleep 30").await;

	let started = std::time::Instant::now();
	let outcome = harness.orchestrator.send_message("w1", "go").await.unwrap();
	assert!(started.elapsed() < Duration::from_secs(10));

	let error = outcome.error().cloned().unwrap();
	assert_eq!(error.kind, SessionErrorKind::Authentication);
	assert!(error.message.contains("claude login"));

	let snapshot = harness.orchestrator.snapshot("w1").await.unwrap();
	assert!(snapshot.messages[1].content.contains("claude login"));
	assert!(!snapshot.messages[1].is_streaming);
	assert!(!snapshot.is_processing);
}

/// Test: Stderr that is not valid UTF-8, followed by more output than a pipe
/// buffer holds, does not stall the turn.
///
/// Why this test is important: If the stderr reader gave up on bad bytes the
/// pipe would fill, the agent would block on its next write, and the turn
/// would hang instead of completing.
#[tokio::test]
async fn test_invalid_utf8_on_stderr_keeps_draining() {
	let harness = Harness::new(
		r#"printf 'warn \377\376 bytes\n' >&2
i=0
while [ $i -lt 2000 ]; do
echo "progress line $i padded out so the pipe buffer fills quickly" >&2
i=$((i+1))
done
cat <<'EOF'
{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}
{"type":"result","subtype":"success"}
EOF"#,
	)
	.await;

	let outcome = tokio::time::timeout(
		EVENT_TIMEOUT,
		harness.orchestrator.send_message("w1", "go"),
	)
	.await
	.expect("turn stalled")
	.unwrap();
	assert_eq!(outcome, TurnOutcome::Completed);

	let snapshot = harness.orchestrator.snapshot("w1").await.unwrap();
	assert_eq!(snapshot.messages[1].content, "hi");
}

#[tokio::test]
async fn test_auth_failure_after_invalid_utf8() {
	let harness = Harness::new(
		"printf 'bad \\377\\n' >&2\necho 'Error: Not authenticated' >&2\nexec sleep 30",
	)
	.await;

	let outcome = harness.orchestrator.send_message("w1", "go").await.unwrap();
	assert_eq!(
		outcome.error().map(|e| e.kind),
		Some(SessionErrorKind::Authentication)
	);
}

#[tokio::test]
async fn test_clean_exit_without_output_says_so() {
	let harness = Harness::new("echo 'harmless warning' >&2\nexit 0").await;

	let outcome = harness.orchestrator.send_message("w1", "anyone there?").await.unwrap();
	assert_eq!(outcome, TurnOutcome::Completed);

	let snapshot = harness.orchestrator.snapshot("w1").await.unwrap();
	assert_eq!(snapshot.messages[1].content, NO_RESPONSE_TEXT);
	assert!(snapshot.last_error.is_none());
}

/// Test: the agent runs in the worktree, gets the prompt after `--`, and no
/// prompt is written to stdin.
///
/// Why this test is important: a prompt starting with `-` must never be
/// parsed as a flag, and the process must run where the session says.
#[tokio::test]
async fn test_invocation_shape() {
	let harness = Harness::new(
		r#"pwd -P > invocation.txt
printf '%s\n' "$@" >> invocation.txt
if read -r line; then echo "stdin:$line" >> invocation.txt; fi
echo '{"type":"result","subtype":"success"}'"#,
	)
	.await;

	harness
		.orchestrator
		.send_message("w1", "--version\u{7} please")
		.await
		.unwrap();

	let invocation = std::fs::read_to_string(harness.worktree_path().join("invocation.txt")).unwrap();
	let lines: Vec<&str> = invocation.lines().collect();
	assert_eq!(Path::new(lines[0]), harness.worktree_path());
	assert!(lines.contains(&"--print"));
	assert!(lines.contains(&"stream-json"));
	assert!(lines.contains(&"--allowedTools"));
	let separator = lines.iter().position(|l| *l == "--").unwrap();
	assert_eq!(lines[separator + 1], "--version please");
	assert!(!invocation.contains("stdin:"));
}

/// Test: abort stops a running turn, twice in a row, with the same result.
///
/// Why this test is important: abort races with natural exit and must be
/// idempotent; partial output stays visible but stops streaming.
#[tokio::test]
async fn test_abort_is_idempotent() {
	let harness = Harness::new(
		"echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"working\"}]}}'\nexec sleep 30",
	)
	.await;
	let mut events = harness.orchestrator.subscribe();

	let orchestrator = harness.orchestrator.clone();
	let turn = tokio::spawn(async move { orchestrator.send_message("w1", "long job").await });

	next_matching(&mut events, |e| {
		matches!(e, SessionEvent::MessageUpdated { message, .. } if message.content == "working")
	})
	.await;

	let err = harness.orchestrator.send_message("w1", "another").await.unwrap_err();
	assert!(matches!(err, OrchestratorError::AlreadyProcessing(_)));
	assert!(harness.orchestrator.get_session_status("w1").await.processing);

	let started = std::time::Instant::now();
	harness.orchestrator.abort_session("w1").await;
	harness.orchestrator.abort_session("w1").await;
	assert!(started.elapsed() < Duration::from_secs(10));

	let outcome = turn.await.unwrap().unwrap();
	assert_eq!(outcome, TurnOutcome::Aborted);

	let snapshot = harness.orchestrator.snapshot("w1").await.unwrap();
	assert!(!snapshot.is_processing);
	assert_eq!(snapshot.phase, SessionPhase::Idle);
	assert!(snapshot.last_error.is_none());
	assert_eq!(snapshot.messages[1].content, "working");
	assert!(!snapshot.messages[1].is_streaming);

	harness.orchestrator.abort_session("w1").await;
	assert_eq!(harness.orchestrator.snapshot("w1").await.unwrap(), snapshot);
}

/// Test: A tool call still running when its turn is aborted ends as an
/// error, and subscribers are told.
///
/// Why this test is important: A call left in `running` after the process
/// is gone shows a spinner that never stops.
#[tokio::test]
async fn test_abort_fails_running_tool_call() {
	let harness = Harness::new(
		"echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"id\":\"t1\",\"name\":\"Bash\",\"input\":{\"command\":\"make\"}}]}}'\nexec sleep 30",
	)
	.await;
	let mut events = harness.orchestrator.subscribe();

	let orchestrator = harness.orchestrator.clone();
	let turn = tokio::spawn(async move { orchestrator.send_message("w1", "build").await });
	next_matching(&mut events, |e| {
		matches!(e, SessionEvent::ToolCallUpdated { tool_call, .. } if tool_call.status == ToolCallStatus::Running)
	})
	.await;

	harness.orchestrator.abort_session("w1").await;
	assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Aborted);

	let failed = next_matching(&mut events, |e| matches!(e, SessionEvent::ToolCallUpdated { .. })).await;
	let SessionEvent::ToolCallUpdated { tool_call, .. } = failed else {
		unreachable!();
	};
	assert_eq!(tool_call.id, "t1");
	assert_eq!(tool_call.status, ToolCallStatus::Error);

	let snapshot = harness.orchestrator.snapshot("w1").await.unwrap();
	assert_eq!(snapshot.messages[1].tool_calls[0].status, ToolCallStatus::Error);
	assert!(!snapshot.messages[1].is_streaming);
}

#[tokio::test]
async fn test_message_finalized_exactly_once() {
	let harness = Harness::new(
		r#"cat <<'EOF'
{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}
{"type":"result","subtype":"success"}
{"type":"result","subtype":"success"}
EOF"#,
	)
	.await;
	let mut events = harness.orchestrator.subscribe();

	harness.orchestrator.send_message("w1", "hello").await.unwrap();

	let mut finalized = 0;
	let mut last_phase = None;
	while let Ok(event) = events.try_recv() {
		match event {
			SessionEvent::MessageFinalized { message, .. } => {
				assert!(!message.is_streaming);
				finalized += 1;
			}
			SessionEvent::SessionStateChanged { phase, .. } => last_phase = Some(phase),
			_ => {}
		}
	}
	assert_eq!(finalized, 1);
	assert_eq!(last_phase, Some(SessionPhase::Idle));
}

/// Test: removing a session mid-turn stops the process and forgets the id.
///
/// Why this test is important: removal must not orphan child processes, and
/// later calls must behave as if the session never existed.
#[tokio::test]
async fn test_remove_while_processing() {
	let harness = Harness::new("exec sleep 30").await;
	let mut events = harness.orchestrator.subscribe();

	let orchestrator = harness.orchestrator.clone();
	let turn = tokio::spawn(async move { orchestrator.send_message("w1", "wait").await });
	next_matching(&mut events, |e| {
		matches!(e, SessionEvent::SessionStateChanged { phase: SessionPhase::Processing, .. })
	})
	.await;

	harness.orchestrator.remove_session("w1").await.unwrap();
	assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Aborted);

	assert!(!harness.orchestrator.get_session_status("w1").await.active);
	assert!(harness.orchestrator.list_sessions().await.is_empty());
	assert!(matches!(
		harness.orchestrator.send_message("w1", "again").await,
		Err(OrchestratorError::SessionNotFound(_))
	));
}

/// Test: re-creating a session aborts the old turn and starts fresh.
///
/// Why this test is important: there must never be two live processes for
/// one worktree id.
#[tokio::test]
async fn test_recreate_replaces_running_session() {
	let harness = Harness::new("exec sleep 30").await;
	let mut events = harness.orchestrator.subscribe();

	let orchestrator = harness.orchestrator.clone();
	let turn = tokio::spawn(async move { orchestrator.send_message("w1", "wait").await });
	next_matching(&mut events, |e| {
		matches!(e, SessionEvent::SessionStateChanged { phase: SessionPhase::Processing, .. })
	})
	.await;

	let status = harness
		.orchestrator
		.create_session("w1", harness.worktree.path().to_str().unwrap())
		.await
		.unwrap();
	assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Aborted);
	assert!(!status.processing);

	let snapshot = harness.orchestrator.snapshot("w1").await.unwrap();
	assert!(snapshot.messages.is_empty());
	assert_eq!(snapshot.usage, Default::default());
}

/// Test: A long turn in one worktree does not hold up another worktree's
/// turn or session management.
///
/// Why this test is important: Sessions are independent. A lock held across
/// one turn's process lifetime would serialize every worktree behind it.
#[tokio::test]
async fn test_sessions_in_different_worktrees_run_concurrently() {
	let bin = TempDir::new().unwrap();
	let agent = write_agent(
		bin.path(),
		r#"if [ -f slow ]; then
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"waiting"}]}}'
exec sleep 30
fi
cat <<'EOF'
{"type":"assistant","message":{"content":[{"type":"text","text":"quick"}]}}
{"type":"result","subtype":"success"}
EOF"#,
	);
	let slow = TempDir::new().unwrap();
	let quick = TempDir::new().unwrap();
	std::fs::write(slow.path().join("slow"), "").unwrap();

	let config = OrchestratorConfig {
		binary_candidates: vec![agent],
		shutdown_grace_ms: 500,
		..Default::default()
	};
	let registry =
		StaticWorktreeRegistry::new([slow.path().to_path_buf(), quick.path().to_path_buf()]);
	let orchestrator = Arc::new(SessionOrchestrator::new(config, Arc::new(registry)));
	orchestrator
		.create_session("slow", slow.path().to_str().unwrap())
		.await
		.unwrap();
	orchestrator
		.create_session("quick", quick.path().to_str().unwrap())
		.await
		.unwrap();
	let mut events = orchestrator.subscribe();

	let slow_turn = {
		let orchestrator = orchestrator.clone();
		tokio::spawn(async move { orchestrator.send_message("slow", "wait").await })
	};
	next_matching(&mut events, |e| {
		matches!(e, SessionEvent::MessageUpdated { message, .. } if message.content == "waiting")
	})
	.await;

	let outcome = tokio::time::timeout(EVENT_TIMEOUT, orchestrator.send_message("quick", "go"))
		.await
		.expect("second worktree was blocked")
		.unwrap();
	assert_eq!(outcome, TurnOutcome::Completed);
	tokio::time::timeout(
		EVENT_TIMEOUT,
		orchestrator.create_session("quick", quick.path().to_str().unwrap()),
	)
	.await
	.expect("create was blocked")
	.unwrap();
	assert!(orchestrator.get_session_status("slow").await.processing);

	orchestrator.abort_session("slow").await;
	assert_eq!(slow_turn.await.unwrap().unwrap(), TurnOutcome::Aborted);
}

/// Test: Interleaved create, remove and send on one id always settle into a
/// consistent state.
///
/// Why this test is important: These calls race in real use (a user closing a
/// worktree while a prompt is starting). None may panic, leave a session
/// stuck processing, or end with two sessions for one id.
#[tokio::test]
async fn test_create_remove_send_race_on_one_id() {
	let harness = Harness::new(
		r#"cat <<'EOF'
{"type":"assistant","message":{"content":[{"type":"text","text":"ok"}]}}
{"type":"result","subtype":"success"}
EOF"#,
	)
	.await;
	let dir = harness.worktree.path().to_str().unwrap().to_string();

	let mut tasks = Vec::new();
	for _ in 0..10 {
		let orchestrator = harness.orchestrator.clone();
		let dir = dir.clone();
		tasks.push(tokio::spawn(async move {
			orchestrator.create_session("w1", &dir).await.map(|_| ())
		}));
		let orchestrator = harness.orchestrator.clone();
		tasks.push(tokio::spawn(async move { orchestrator.remove_session("w1").await }));
		let orchestrator = harness.orchestrator.clone();
		tasks.push(tokio::spawn(async move {
			orchestrator.send_message("w1", "hi").await.map(|_| ())
		}));
	}
	for task in tasks {
		let result = tokio::time::timeout(EVENT_TIMEOUT, task)
			.await
			.expect("operation hung")
			.unwrap();
		match result {
			Ok(()) => {}
			Err(OrchestratorError::SessionNotFound(_) | OrchestratorError::AlreadyProcessing(_)) => {}
			Err(other) => panic!("unexpected error: {other}"),
		}
	}

	let sessions = harness.orchestrator.list_sessions().await;
	assert!(sessions.len() <= 1);
	for (id, status) in &sessions {
		assert_eq!(id, "w1");
		assert!(!status.processing);
		assert_eq!(status.phase, SessionPhase::Idle);
	}

	harness.orchestrator.create_session("w1", &dir).await.unwrap();
	let outcome = harness.orchestrator.send_message("w1", "again").await.unwrap();
	assert_eq!(outcome, TurnOutcome::Completed);
}

#[tokio::test]
async fn test_shutdown_removes_everything() {
	let harness = Harness::new("exit 0").await;
	harness.orchestrator.shutdown().await;
	assert!(harness.orchestrator.list_sessions().await.is_empty());
}

fn git(dir: &Path, args: &[&str]) {
	let output = Command::new("git")
		.args(args)
		.current_dir(dir)
		.output()
		.unwrap();
	assert!(
		output.status.success(),
		"git {args:?} failed: {}",
		String::from_utf8_lossy(&output.stderr)
	);
}

/// Test: the git-backed registry admits linked worktrees and nothing else.
///
/// Why this test is important: this is the production trust boundary for
/// working directories.
#[tokio::test]
async fn test_git_registry_gates_session_creation() {
	let temp = TempDir::new().unwrap();
	let repo = temp.path().join("repo");
	std::fs::create_dir(&repo).unwrap();
	git(&repo, &["init", "-q"]);
	git(&repo, &["config", "user.email", "test@example.com"]);
	git(&repo, &["config", "user.name", "Test"]);
	git(&repo, &["commit", "-q", "--allow-empty", "-m", "init"]);
	let linked = temp.path().join("linked");
	git(
		&repo,
		&["worktree", "add", "-q", "-b", "feature", linked.to_str().unwrap()],
	);
	let outsider = temp.path().join("outsider");
	std::fs::create_dir(&outsider).unwrap();

	let registry = GitWorktreeRegistry::new(&repo);
	let orchestrator = SessionOrchestrator::new(OrchestratorConfig::default(), Arc::new(registry));

	orchestrator
		.create_session("main", repo.to_str().unwrap())
		.await
		.unwrap();
	orchestrator
		.create_session("feature", linked.to_str().unwrap())
		.await
		.unwrap();
	let err = orchestrator
		.create_session("outsider", outsider.to_str().unwrap())
		.await
		.unwrap_err();
	assert!(matches!(err, OrchestratorError::UnknownWorktree(_)));

	let ids: Vec<String> = orchestrator
		.list_sessions()
		.await
		.into_iter()
		.map(|(id, _)| id)
		.collect();
	assert_eq!(ids, vec!["feature".to_string(), "main".to_string()]);
}

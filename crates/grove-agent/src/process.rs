// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Agent child process plumbing: argv, spawning, stderr monitoring and the
//! terminate-then-kill shutdown sequence.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use regex::RegexSet;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::env::EnvMap;

/// Shown inline when the agent CLI is not logged in.
pub const AUTH_REMEDIATION: &str =
	"Claude CLI is not authenticated. Run `claude login` in a terminal, then try again.";

/// Number of stderr lines retained for diagnostics.
pub const STDERR_TAIL_LINES: usize = 20;

/// Longest stderr line kept; the rest of the line is read and discarded.
pub const STDERR_LINE_MAX_BYTES: usize = 8 * 1024;

static AUTH_FAILURE_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
	RegexSet::new([
		r"(?i)not\s+authenticated",
		r"(?i)please\s+log\s*in",
		r"(?i)invalid\s+api\s+key",
		r"(?i)claude\s+login",
	])
	.unwrap()
});

/// Whether a stderr line means the agent needs the user to log in.
pub fn is_auth_failure(line: &str) -> bool {
	AUTH_FAILURE_PATTERNS.is_match(line)
}

/// Build the one-shot invocation argv. The prompt always comes after `--`.
pub fn agent_args(allowed_tools: &str, prompt: &str) -> Vec<String> {
	let mut args = vec![
		"--print".to_string(),
		"--output-format".to_string(),
		"stream-json".to_string(),
		"--verbose".to_string(),
	];
	if !allowed_tools.is_empty() {
		args.push("--allowedTools".to_string());
		args.push(allowed_tools.to_string());
	}
	args.push("--".to_string());
	args.push(prompt.to_string());
	args
}

/// Spawn the agent with a cleared environment, closed stdin and piped
/// stdout/stderr. The child is killed if its handle is dropped.
pub fn spawn_agent(
	binary: &Path,
	working_directory: &Path,
	env: &EnvMap,
	args: &[String],
) -> std::io::Result<Child> {
	let child = Command::new(binary)
		.args(args)
		.current_dir(working_directory)
		.env_clear()
		.envs(env)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true)
		.spawn()?;

	debug!(
		binary = %binary.display(),
		cwd = %working_directory.display(),
		pid = ?child.id(),
		"spawned agent process"
	);
	Ok(child)
}

/// Last few stderr lines of a process.
#[derive(Debug, Default, Clone)]
pub struct StderrTail {
	lines: VecDeque<String>,
}

impl StderrTail {
	pub fn push(&mut self, line: String) {
		if self.lines.len() == STDERR_TAIL_LINES {
			self.lines.pop_front();
		}
		self.lines.push_back(line);
	}

	pub fn is_empty(&self) -> bool {
		self.lines.is_empty()
	}

	pub fn last_line(&self) -> Option<&str> {
		self.lines.back().map(String::as_str)
	}

	pub fn joined(&self) -> String {
		self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
	}
}

/// Drain stderr to completion, cancelling `auth_failed` on the first line
/// that looks like an authentication failure.
///
/// Lines are decoded lossily and cut at [`STDERR_LINE_MAX_BYTES`], so the
/// pipe keeps draining whatever the agent writes.
pub async fn watch_stderr<R>(stderr: R, auth_failed: CancellationToken) -> StderrTail
where
	R: AsyncRead + Unpin,
{
	let mut tail = StderrTail::default();
	let mut reader = BufReader::new(stderr);
	let mut line = Vec::new();

	loop {
		let available = match reader.fill_buf().await {
			Ok([]) => break,
			Ok(available) => available,
			Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
			Err(e) => {
				debug!(error = %e, "stderr read failed");
				break;
			}
		};
		let (used, complete) = match available.iter().position(|b| *b == b'\n') {
			Some(pos) => (pos + 1, true),
			None => (available.len(), false),
		};
		let keep = used.min(STDERR_LINE_MAX_BYTES.saturating_sub(line.len()));
		line.extend_from_slice(&available[..keep]);
		reader.consume(used);

		if complete {
			record_stderr_line(&line, &mut tail, &auth_failed);
			line.clear();
		}
	}
	record_stderr_line(&line, &mut tail, &auth_failed);
	tail
}

fn record_stderr_line(raw: &[u8], tail: &mut StderrTail, auth_failed: &CancellationToken) {
	let line = String::from_utf8_lossy(raw);
	let line = line.trim_end();
	if line.is_empty() {
		return;
	}
	debug!(line = %line, "agent stderr");
	if !auth_failed.is_cancelled() && is_auth_failure(line) {
		auth_failed.cancel();
	}
	tail.push(line.to_string());
}

fn send_sigterm(pid: u32) -> bool {
	#[cfg(unix)]
	{
		let Ok(pid) = libc::pid_t::try_from(pid) else {
			return false;
		};
		// SAFETY: kill(2) with a pid we spawned and have not yet reaped.
		unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
	}
	#[cfg(not(unix))]
	{
		let _ = pid;
		false
	}
}

/// Ask the child to exit, wait up to `grace`, then force-kill it.
///
/// Safe to call on a child that already exited.
pub async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
	if let Some(status) = child.try_wait()? {
		return Ok(status);
	}

	if let Some(pid) = child.id() {
		if send_sigterm(pid) {
			match tokio::time::timeout(grace, child.wait()).await {
				Ok(status) => {
					debug!(pid, "agent exited after SIGTERM");
					return status;
				}
				Err(_) => {
					warn!(pid, grace_ms = grace.as_millis() as u64, "agent ignored SIGTERM, killing");
				}
			}
		}
	}

	child.kill().await?;
	child.wait().await
}

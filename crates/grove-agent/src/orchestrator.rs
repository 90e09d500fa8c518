// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! The session orchestrator: one agent session per worktree.
//!
//! Sessions live in a map keyed by worktree id. Each session owns at most one
//! turn at a time, and a turn owns its child process from spawn to reap.
//! Aborting a turn cancels its token; the turn itself then shuts the process
//! down and releases the session, so there is exactly one place that ever
//! touches the child.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::{broadcast, watch, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::decoder::{StreamDecoder, StreamEffect};
use crate::env::build_child_environment;
use crate::error::{OrchestratorError, OrchestratorResult, SessionError, SessionErrorKind};
use crate::events::SessionEvent;
use crate::model::{
	Message, SessionPhase, SessionSnapshot, SessionStatus, ToolCall, ToolCallStatus, UsageStats,
};
use crate::process::{self, AUTH_REMEDIATION};
use crate::validate;
use crate::worktree::WorktreeRegistry;

/// Appended when the agent exits cleanly without saying anything.
pub const NO_RESPONSE_TEXT: &str = "The agent exited without a response.";

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// How a `send_message` call ended, once the process has been reaped.
#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
	Completed,
	Failed(SessionError),
	Aborted,
}

impl TurnOutcome {
	pub fn error(&self) -> Option<&SessionError> {
		match self {
			Self::Failed(error) => Some(error),
			_ => None,
		}
	}
}

/// Cancellation handle for the turn in flight.
#[derive(Debug)]
struct TurnControl {
	cancel: CancellationToken,
	finished: watch::Receiver<bool>,
}

#[derive(Debug)]
struct SessionState {
	phase: SessionPhase,
	is_processing: bool,
	messages: Vec<Message>,
	current_assistant_message_id: Option<String>,
	usage: UsageStats,
	last_error: Option<SessionError>,
	turn: Option<TurnControl>,
	/// Set once the session has left the map. Rejects new prompts.
	removed: bool,
}

impl SessionState {
	fn new() -> Self {
		Self {
			phase: SessionPhase::Idle,
			is_processing: false,
			messages: Vec::new(),
			current_assistant_message_id: None,
			usage: UsageStats::default(),
			last_error: None,
			turn: None,
			removed: false,
		}
	}

	fn current_message_mut(&mut self) -> Option<&mut Message> {
		let id = self.current_assistant_message_id.as_deref()?;
		self.messages.iter_mut().rev().find(|m| m.id == id)
	}

	/// Stop streaming the in-flight assistant message. Returns it the first
	/// time only.
	fn finalize_current(&mut self, error_text: Option<&str>) -> Option<Message> {
		let id = self.current_assistant_message_id.take()?;
		let message = self.messages.iter_mut().rev().find(|m| m.id == id)?;
		if let Some(text) = error_text {
			append_block(&mut message.content, text);
		}
		message.is_streaming = false;
		Some(message.clone())
	}

	/// Mark tool calls of the in-flight message that never got a result as
	/// failed, then finalize the message.
	fn close_current(
		&mut self,
		worktree_id: &str,
		error_text: Option<&str>,
		events: &mut Vec<SessionEvent>,
	) {
		if let Some(message) = self.current_message_mut() {
			for call in message.tool_calls.iter_mut() {
				if call.status.is_terminal() {
					continue;
				}
				call.status = ToolCallStatus::Error;
				events.push(SessionEvent::ToolCallUpdated {
					worktree_id: worktree_id.to_string(),
					message_id: message.id.clone(),
					tool_call: call.clone(),
				});
			}
		}
		if let Some(message) = self.finalize_current(error_text) {
			events.push(SessionEvent::MessageFinalized {
				worktree_id: worktree_id.to_string(),
				message,
			});
		}
	}

	/// Running tool call with `id`, newest first.
	fn open_tool_call_mut(&mut self, id: &str) -> Option<(String, &mut ToolCall)> {
		self.messages.iter_mut().rev().find_map(|message| {
			let message_id = message.id.clone();
			message
				.tool_call_mut(id)
				.filter(|call| !call.status.is_terminal())
				.map(|call| (message_id, call))
		})
	}
}

#[derive(Debug)]
struct SessionHandle {
	worktree_id: String,
	working_directory: PathBuf,
	state: Mutex<SessionState>,
}

impl SessionHandle {
	fn lock(&self) -> MutexGuard<'_, SessionState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn status(&self) -> SessionStatus {
		let state = self.lock();
		SessionStatus {
			active: true,
			processing: state.is_processing,
			phase: state.phase,
			working_directory: Some(self.working_directory.clone()),
			last_error: state.last_error.clone(),
		}
	}

	fn snapshot(&self) -> SessionSnapshot {
		let state = self.lock();
		SessionSnapshot {
			worktree_id: self.worktree_id.clone(),
			working_directory: self.working_directory.clone(),
			phase: state.phase,
			is_processing: state.is_processing,
			messages: state.messages.clone(),
			current_assistant_message_id: state.current_assistant_message_id.clone(),
			usage: state.usage.clone(),
			last_error: state.last_error.clone(),
		}
	}
}

/// How the stdout read loop stopped.
enum StreamEnd {
	Eof,
	Finished,
	Aborted,
	AuthFailure,
	ReadFailed(std::io::Error),
}

/// Owns every agent session. Construct once and share behind an `Arc`.
pub struct SessionOrchestrator {
	config: Arc<OrchestratorConfig>,
	registry: Arc<dyn WorktreeRegistry>,
	sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
	/// Serializes create/remove per id without blocking other ids.
	gates: Gates,
	events: broadcast::Sender<SessionEvent>,
}

impl SessionOrchestrator {
	pub fn new(config: OrchestratorConfig, registry: Arc<dyn WorktreeRegistry>) -> Self {
		let (events, _) = broadcast::channel(config.event_capacity.max(1));
		Self {
			config: Arc::new(config),
			registry,
			sessions: RwLock::new(HashMap::new()),
			gates: Mutex::new(HashMap::new()),
			events,
		}
	}

	pub fn config(&self) -> &OrchestratorConfig {
		&self.config
	}

	/// Receive every event emitted from now on, for all sessions.
	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.events.subscribe()
	}

	/// Create a session for `worktree_id`, replacing (and aborting) any
	/// existing one.
	#[instrument(skip_all, fields(worktree_id = %worktree_id))]
	pub async fn create_session(
		&self,
		worktree_id: &str,
		working_directory: &str,
	) -> OrchestratorResult<SessionStatus> {
		if worktree_id.trim().is_empty() {
			return Err(OrchestratorError::EmptyWorktreeId);
		}
		let working_directory = validate::validate_working_directory(working_directory)?;
		if !self.registry.is_known_worktree_path(&working_directory).await {
			warn!(path = %working_directory.display(), "rejected unregistered worktree");
			return Err(OrchestratorError::UnknownWorktree(working_directory));
		}

		let _gate = self.lock_gate(worktree_id).await;

		let previous = {
			let sessions = self.sessions.read().await;
			match sessions.get(worktree_id) {
				Some(existing) => Some(existing.clone()),
				None if sessions.len() >= self.config.max_sessions => {
					return Err(OrchestratorError::CapacityExceeded {
						max: self.config.max_sessions,
					});
				}
				None => None,
			}
		};

		// The old session keeps its slot until the replacement is inserted,
		// but accepts no new prompts and has no live process from here on.
		if let Some(previous) = &previous {
			{
				let mut state = previous.lock();
				state.removed = true;
				state.phase = SessionPhase::Disconnected;
			}
			self.abort_handle(previous).await;
			self.emit(SessionEvent::SessionStateChanged {
				worktree_id: worktree_id.to_string(),
				phase: SessionPhase::Disconnected,
			});
			debug!("replaced existing session");
		}

		let handle = Arc::new(SessionHandle {
			worktree_id: worktree_id.to_string(),
			working_directory: working_directory.clone(),
			state: Mutex::new(SessionState::new()),
		});
		{
			let mut sessions = self.sessions.write().await;
			if !sessions.contains_key(worktree_id) && sessions.len() >= self.config.max_sessions {
				return Err(OrchestratorError::CapacityExceeded {
					max: self.config.max_sessions,
				});
			}
			sessions.insert(worktree_id.to_string(), handle.clone());
		}

		info!(path = %working_directory.display(), "session created");
		self.emit(SessionEvent::SessionStateChanged {
			worktree_id: worktree_id.to_string(),
			phase: SessionPhase::Idle,
		});
		Ok(handle.status())
	}

	/// Run one prompt to completion.
	///
	/// Validation failures return `Err` without touching the session. Once
	/// the prompt is accepted every failure is reported through the returned
	/// [`TurnOutcome`], `last_error` and a `SessionError` event instead.
	#[instrument(skip_all, fields(worktree_id = %worktree_id, len = text.len()))]
	pub async fn send_message(
		&self,
		worktree_id: &str,
		text: &str,
	) -> OrchestratorResult<TurnOutcome> {
		let handle = self
			.session(worktree_id)
			.await
			.ok_or_else(|| OrchestratorError::SessionNotFound(worktree_id.to_string()))?;

		validate::check_prompt(text, self.config.max_prompt_chars)?;
		let prompt = validate::sanitize_prompt(text, self.config.max_prompt_chars);
		if prompt.trim().is_empty() {
			return Err(OrchestratorError::EmptyPrompt);
		}
		let binary = validate::resolve_agent_binary(&self.config.resolved_binary_candidates())?;

		let cancel = CancellationToken::new();
		let (finished_tx, finished_rx) = watch::channel(false);
		let accepted = {
			let mut state = handle.lock();
			if state.removed {
				return Err(OrchestratorError::SessionNotFound(worktree_id.to_string()));
			}
			if state.is_processing {
				return Err(OrchestratorError::AlreadyProcessing(worktree_id.to_string()));
			}
			state.is_processing = true;
			state.phase = SessionPhase::Processing;
			state.last_error = None;
			state.turn = Some(TurnControl {
				cancel: cancel.clone(),
				finished: finished_rx,
			});

			let user = Message::user(prompt.clone());
			let assistant = Message::assistant_placeholder();
			state.current_assistant_message_id = Some(assistant.id.clone());
			state.messages.push(user.clone());
			state.messages.push(assistant.clone());
			[user, assistant]
		};

		let mut guard = TurnGuard {
			orchestrator: self,
			handle: handle.clone(),
			finished: finished_tx,
			closed: false,
		};
		self.emit(SessionEvent::SessionStateChanged {
			worktree_id: worktree_id.to_string(),
			phase: SessionPhase::Processing,
		});
		for message in accepted {
			self.emit(SessionEvent::MessageUpdated {
				worktree_id: worktree_id.to_string(),
				message,
			});
		}

		let (outcome, phase) = self.run_turn(&handle, &binary, &prompt, &cancel).await;
		guard.close(outcome.error(), phase);

		match &outcome {
			TurnOutcome::Completed => info!("turn completed"),
			TurnOutcome::Aborted => info!("turn aborted"),
			TurnOutcome::Failed(error) => warn!(kind = ?error.kind, error = %error, "turn failed"),
		}
		Ok(outcome)
	}

	/// Stop the turn in flight, if any, and wait until its process is gone.
	///
	/// Idempotent. Unknown ids and idle sessions are a no-op.
	#[instrument(skip_all, fields(worktree_id = %worktree_id))]
	pub async fn abort_session(&self, worktree_id: &str) {
		if let Some(handle) = self.session(worktree_id).await {
			self.abort_handle(&handle).await;
		}
	}

	pub async fn get_session_status(&self, worktree_id: &str) -> SessionStatus {
		match self.session(worktree_id).await {
			Some(handle) => handle.status(),
			None => SessionStatus::inactive(),
		}
	}

	/// Abort, then forget the session.
	#[instrument(skip_all, fields(worktree_id = %worktree_id))]
	pub async fn remove_session(&self, worktree_id: &str) -> OrchestratorResult<()> {
		let _gate = self.lock_gate(worktree_id).await;

		let removed = self.sessions.write().await.remove(worktree_id);
		let Some(handle) = removed else {
			return Err(OrchestratorError::SessionNotFound(worktree_id.to_string()));
		};

		{
			let mut state = handle.lock();
			state.removed = true;
			state.phase = SessionPhase::Disconnected;
		}
		self.abort_handle(&handle).await;
		self.emit(SessionEvent::SessionStateChanged {
			worktree_id: worktree_id.to_string(),
			phase: SessionPhase::Disconnected,
		});
		info!("session removed");
		Ok(())
	}

	/// Status of every session, ordered by id.
	pub async fn list_sessions(&self) -> Vec<(String, SessionStatus)> {
		let handles: Vec<Arc<SessionHandle>> = self.sessions.read().await.values().cloned().collect();
		let mut list: Vec<_> = handles
			.iter()
			.map(|h| (h.worktree_id.clone(), h.status()))
			.collect();
		list.sort_by(|a, b| a.0.cmp(&b.0));
		list
	}

	pub async fn snapshot(&self, worktree_id: &str) -> Option<SessionSnapshot> {
		self.session(worktree_id).await.map(|h| h.snapshot())
	}

	/// Remove every session, stopping their processes.
	pub async fn shutdown(&self) {
		let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
		for id in ids {
			// A concurrent remove may win the race; that is fine.
			let _ = self.remove_session(&id).await;
		}
		info!("orchestrator shut down");
	}

	async fn session(&self, worktree_id: &str) -> Option<Arc<SessionHandle>> {
		self.sessions.read().await.get(worktree_id).cloned()
	}

	/// Exclusive hold on `worktree_id`'s gate until the lease is dropped.
	async fn lock_gate(&self, worktree_id: &str) -> GateLease<'_> {
		let gate = {
			let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
			gates.entry(worktree_id.to_string()).or_default().clone()
		};
		let mut lease = GateLease {
			gates: &self.gates,
			worktree_id: worktree_id.to_string(),
			gate,
			guard: None,
		};
		lease.guard = Some(lease.gate.clone().lock_owned().await);
		lease
	}

	async fn abort_handle(&self, handle: &SessionHandle) {
		let control = {
			let state = handle.lock();
			state
				.turn
				.as_ref()
				.map(|turn| (turn.cancel.clone(), turn.finished.clone()))
		};
		let Some((cancel, mut finished)) = control else {
			return;
		};

		debug!(worktree_id = %handle.worktree_id, "aborting turn");
		cancel.cancel();
		// Errors only when the turn was dropped, which also means it is over.
		let _ = finished.wait_for(|done| *done).await;
	}

	fn emit(&self, event: SessionEvent) {
		// No subscribers is not an error.
		let _ = self.events.send(event);
	}

	fn emit_all(&self, events: Vec<SessionEvent>) {
		for event in events {
			self.emit(event);
		}
	}

	/// Spawn, stream and reap one agent process.
	async fn run_turn(
		&self,
		handle: &SessionHandle,
		binary: &Path,
		prompt: &str,
		cancel: &CancellationToken,
	) -> (TurnOutcome, SessionPhase) {
		if cancel.is_cancelled() {
			return (TurnOutcome::Aborted, SessionPhase::Idle);
		}

		let args = process::agent_args(&self.config.allowed_tools_arg(), prompt);
		let env = build_child_environment();
		let mut child = match process::spawn_agent(binary, &handle.working_directory, &env, &args) {
			Ok(child) => child,
			Err(e) => {
				let error = SessionError::new(
					SessionErrorKind::Transport,
					format!("Failed to start agent: {e}"),
				);
				return (TurnOutcome::Failed(error), SessionPhase::Disconnected);
			}
		};
		let pid = child.id();
		info!(worktree_id = %handle.worktree_id, pid, "agent process started");

		let auth_failed = CancellationToken::new();
		let stderr_task = child
			.stderr
			.take()
			.map(|stderr| tokio::spawn(process::watch_stderr(stderr, auth_failed.clone())));

		let mut agent_error = None;
		let end = self
			.pump_stdout(handle, &mut child, cancel, &auth_failed, &mut agent_error)
			.await;

		let grace = self.config.shutdown_grace();
		let exit = match &end {
			StreamEnd::Aborted | StreamEnd::AuthFailure | StreamEnd::ReadFailed(_) => {
				process::terminate(&mut child, grace).await
			}
			StreamEnd::Finished => match tokio::time::timeout(grace, child.wait()).await {
				Ok(status) => status,
				Err(_) => process::terminate(&mut child, grace).await,
			},
			StreamEnd::Eof => {
				let waited = tokio::select! {
					status = child.wait() => Some(status),
					_ = cancel.cancelled() => None,
				};
				match waited {
					Some(status) => status,
					None => process::terminate(&mut child, grace).await,
				}
			}
		};

		let stderr_tail = match stderr_task {
			Some(task) => match tokio::time::timeout(grace, task).await {
				Ok(Ok(tail)) => tail,
				_ => Default::default(),
			},
			None => Default::default(),
		};
		debug!(pid, ?exit, stderr = %stderr_tail.joined(), "agent process reaped");

		match end {
			StreamEnd::Aborted => (TurnOutcome::Aborted, SessionPhase::Idle),
			StreamEnd::AuthFailure => (auth_outcome(), SessionPhase::Disconnected),
			StreamEnd::ReadFailed(e) => (
				TurnOutcome::Failed(SessionError::new(
					SessionErrorKind::Transport,
					format!("Failed to read agent output: {e}"),
				)),
				SessionPhase::Disconnected,
			),
			StreamEnd::Finished => match agent_error {
				Some(error) => (TurnOutcome::Failed(error), SessionPhase::Idle),
				None => (TurnOutcome::Completed, SessionPhase::Idle),
			},
			StreamEnd::Eof if cancel.is_cancelled() => (TurnOutcome::Aborted, SessionPhase::Idle),
			StreamEnd::Eof if auth_failed.is_cancelled() => {
				(auth_outcome(), SessionPhase::Disconnected)
			}
			StreamEnd::Eof => match exit {
				Ok(status) if status.success() => {
					self.fill_empty_response(handle);
					(TurnOutcome::Completed, SessionPhase::Idle)
				}
				Ok(status) => {
					let mut message = format!("Agent process failed ({status})");
					if let Some(line) = stderr_tail.last_line() {
						message.push_str(": ");
						message.push_str(line);
					}
					(
						TurnOutcome::Failed(SessionError::new(
							SessionErrorKind::AbnormalTermination,
							message,
						)),
						SessionPhase::Disconnected,
					)
				}
				Err(e) => (
					TurnOutcome::Failed(SessionError::new(
						SessionErrorKind::Transport,
						format!("Failed to wait for agent: {e}"),
					)),
					SessionPhase::Disconnected,
				),
			},
		}
	}

	/// Feed stdout through the decoder until the turn finishes, the stream
	/// closes, or the turn is cut short.
	async fn pump_stdout(
		&self,
		handle: &SessionHandle,
		child: &mut Child,
		cancel: &CancellationToken,
		auth_failed: &CancellationToken,
		agent_error: &mut Option<SessionError>,
	) -> StreamEnd {
		let Some(mut stdout) = child.stdout.take() else {
			return StreamEnd::ReadFailed(std::io::Error::other("agent stdout was not captured"));
		};
		let mut decoder = StreamDecoder::new(self.config.max_line_bytes);
		let mut buf = vec![0u8; READ_CHUNK_BYTES];

		loop {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => return StreamEnd::Aborted,
				_ = auth_failed.cancelled() => return StreamEnd::AuthFailure,
				read = stdout.read(&mut buf) => match read {
					Ok(0) => {
						let effects = decoder.finish();
						return if self.apply_effects(handle, effects, agent_error) {
							StreamEnd::Finished
						} else {
							StreamEnd::Eof
						};
					}
					Ok(n) => {
						let effects = decoder.feed(&buf[..n]);
						if self.apply_effects(handle, effects, agent_error) {
							return StreamEnd::Finished;
						}
					}
					Err(e) => return StreamEnd::ReadFailed(e),
				},
			}
		}
	}

	/// Apply decoded effects in order. Returns true once the turn's terminal
	/// record was seen; anything after it is dropped.
	fn apply_effects(
		&self,
		handle: &SessionHandle,
		effects: Vec<StreamEffect>,
		agent_error: &mut Option<SessionError>,
	) -> bool {
		let worktree_id = &handle.worktree_id;
		let mut events = Vec::new();
		let mut finished = false;

		{
			let mut state = handle.lock();
			for effect in effects {
				match effect {
					StreamEffect::AppendText(text) => {
						if let Some(message) = state.current_message_mut() {
							message.content.push_str(&text);
							events.push(SessionEvent::MessageUpdated {
								worktree_id: worktree_id.clone(),
								message: message.clone(),
							});
						}
					}
					StreamEffect::ToolCallStarted { id, name, input } => {
						let Some(message) = state.current_message_mut() else {
							continue;
						};
						if message.tool_call_mut(&id).is_some() {
							debug!(tool_use_id = %id, "ignoring duplicate tool_use");
							continue;
						}
						let call = ToolCall {
							id,
							name,
							input,
							output: None,
							status: ToolCallStatus::Running,
						};
						message.tool_calls.push(call.clone());
						events.push(SessionEvent::ToolCallUpdated {
							worktree_id: worktree_id.clone(),
							message_id: message.id.clone(),
							tool_call: call,
						});
					}
					StreamEffect::ToolCallFinished {
						id,
						output,
						is_error,
					} => match state.open_tool_call_mut(&id) {
						Some((message_id, call)) => {
							call.output = Some(output);
							call.status = if is_error {
								ToolCallStatus::Error
							} else {
								ToolCallStatus::Completed
							};
							events.push(SessionEvent::ToolCallUpdated {
								worktree_id: worktree_id.clone(),
								message_id,
								tool_call: call.clone(),
							});
						}
						None => debug!(tool_use_id = %id, "ignoring result for unknown tool call"),
					},
					StreamEffect::TurnFinished(result) => {
						state.usage.accumulate(&result.usage);
						events.push(SessionEvent::UsageUpdated {
							worktree_id: worktree_id.clone(),
							usage: state.usage.clone(),
						});
						state.close_current(worktree_id, result.error_text.as_deref(), &mut events);
						if let Some(text) = result.error_text {
							*agent_error = Some(SessionError::new(SessionErrorKind::Agent, text));
						}
						finished = true;
						break;
					}
				}
			}
		}

		self.emit_all(events);
		finished
	}

	fn fill_empty_response(&self, handle: &SessionHandle) {
		let message = {
			let mut state = handle.lock();
			match state.current_message_mut() {
				Some(message) if message.content.is_empty() && message.tool_calls.is_empty() => {
					message.content.push_str(NO_RESPONSE_TEXT);
					Some(message.clone())
				}
				_ => None,
			}
		};
		if let Some(message) = message {
			self.emit(SessionEvent::MessageUpdated {
				worktree_id: handle.worktree_id.clone(),
				message,
			});
		}
	}

	/// Release the session after a turn: finalize the assistant message and
	/// its unfinished tool calls, record the error, clear the processing flag.
	fn close_turn(&self, handle: &SessionHandle, error: Option<&SessionError>, phase: SessionPhase) {
		let worktree_id = &handle.worktree_id;
		let mut events = Vec::new();
		{
			let mut state = handle.lock();
			state.close_current(worktree_id, error.map(|e| e.message.as_str()), &mut events);
			if let Some(error) = error {
				state.last_error = Some(error.clone());
				events.push(SessionEvent::SessionError {
					worktree_id: worktree_id.clone(),
					error: error.clone(),
				});
			}
			state.is_processing = false;
			state.turn = None;
			if !state.removed {
				state.phase = phase;
				events.push(SessionEvent::SessionStateChanged {
					worktree_id: worktree_id.clone(),
					phase,
				});
			}
		}
		self.emit_all(events);
	}
}

fn auth_outcome() -> TurnOutcome {
	TurnOutcome::Failed(SessionError::new(
		SessionErrorKind::Authentication,
		AUTH_REMEDIATION,
	))
}

fn append_block(content: &mut String, text: &str) {
	if !content.is_empty() {
		content.push_str("\n\n");
	}
	content.push_str(text);
}

type Gates = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Held gate for one id. Dropping it unlocks the gate and forgets it when no
/// other caller holds a reference, including when the wait was cancelled.
struct GateLease<'a> {
	gates: &'a Gates,
	worktree_id: String,
	gate: Arc<tokio::sync::Mutex<()>>,
	guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateLease<'_> {
	fn drop(&mut self) {
		drop(self.guard.take());
		let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
		// Only the map and this lease hold it: nobody is waiting.
		let ours = gates
			.get(&self.worktree_id)
			.is_some_and(|gate| Arc::ptr_eq(gate, &self.gate));
		if ours && Arc::strong_count(&self.gate) == 2 {
			gates.remove(&self.worktree_id);
		}
	}
}

/// Releases the session even if the `send_message` future is dropped
/// mid-turn. The child itself is killed on drop.
struct TurnGuard<'a> {
	orchestrator: &'a SessionOrchestrator,
	handle: Arc<SessionHandle>,
	finished: watch::Sender<bool>,
	closed: bool,
}

impl TurnGuard<'_> {
	fn close(&mut self, error: Option<&SessionError>, phase: SessionPhase) {
		if std::mem::replace(&mut self.closed, true) {
			return;
		}
		self.orchestrator.close_turn(&self.handle, error, phase);
		let _ = self.finished.send(true);
	}
}

impl Drop for TurnGuard<'_> {
	fn drop(&mut self) {
		if !self.closed {
			warn!(worktree_id = %self.handle.worktree_id, "turn dropped before completion");
			self.close(None, SessionPhase::Idle);
		}
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
	User,
	Assistant,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
	Pending,
	Running,
	Completed,
	Error,
}

impl ToolCallStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Completed | Self::Error)
	}
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
	/// Correlates the invocation with its result; copied verbatim from the
	/// agent's `tool_use` block.
	pub id: String,
	pub name: String,
	pub input: Value,
	pub output: Option<String>,
	pub status: ToolCallStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
	pub id: String,
	pub role: MessageRole,
	pub content: String,
	pub timestamp: DateTime<Utc>,
	pub is_streaming: bool,
	/// Tool calls requested while this message was streaming.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tool_calls: Vec<ToolCall>,
}

impl Message {
	pub fn user(content: impl Into<String>) -> Self {
		Self {
			id: new_message_id(),
			role: MessageRole::User,
			content: content.into(),
			timestamp: Utc::now(),
			is_streaming: false,
			tool_calls: Vec::new(),
		}
	}

	/// Empty assistant message that is still being streamed.
	pub fn assistant_placeholder() -> Self {
		Self {
			id: new_message_id(),
			role: MessageRole::Assistant,
			content: String::new(),
			timestamp: Utc::now(),
			is_streaming: true,
			tool_calls: Vec::new(),
		}
	}

	pub fn tool_call_mut(&mut self, id: &str) -> Option<&mut ToolCall> {
		self.tool_calls.iter_mut().find(|t| t.id == id)
	}
}

fn new_message_id() -> String {
	format!("M-{}", uuid::Uuid::new_v4())
}

/// Cumulative token and cost accounting for a session.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
	pub total_cost_usd: f64,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub cache_creation_input_tokens: u64,
	pub cache_read_input_tokens: u64,
	pub total_turns: u64,
	pub last_duration_ms: Option<u64>,
}

/// Usage reported by a single finalized turn. Absent fields count as zero
/// and leave `last_duration_ms` untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageDelta {
	pub cost_usd: f64,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub cache_creation_input_tokens: u64,
	pub cache_read_input_tokens: u64,
	pub turns: u64,
	pub duration_ms: Option<u64>,
}

impl UsageStats {
	/// Add a turn's usage. Counters only ever grow; the duration is replaced.
	pub fn accumulate(&mut self, delta: &UsageDelta) {
		if delta.cost_usd.is_finite() && delta.cost_usd > 0.0 {
			self.total_cost_usd += delta.cost_usd;
		}
		self.input_tokens = self.input_tokens.saturating_add(delta.input_tokens);
		self.output_tokens = self.output_tokens.saturating_add(delta.output_tokens);
		self.cache_creation_input_tokens = self
			.cache_creation_input_tokens
			.saturating_add(delta.cache_creation_input_tokens);
		self.cache_read_input_tokens = self
			.cache_read_input_tokens
			.saturating_add(delta.cache_read_input_tokens);
		self.total_turns = self.total_turns.saturating_add(delta.turns);
		if let Some(duration) = delta.duration_ms {
			self.last_duration_ms = Some(duration);
		}
	}
}

/// Lifecycle phase of a session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
	/// No session exists for the id.
	Uninitialized,
	#[default]
	Idle,
	Processing,
	/// The last process went away without finishing its turn.
	Disconnected,
}

/// Side-effect free view returned by `get_session_status`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
	pub active: bool,
	pub processing: bool,
	pub phase: SessionPhase,
	pub working_directory: Option<PathBuf>,
	pub last_error: Option<SessionError>,
}

impl SessionStatus {
	pub fn inactive() -> Self {
		Self {
			active: false,
			processing: false,
			phase: SessionPhase::Uninitialized,
			working_directory: None,
			last_error: None,
		}
	}
}

/// Owned copy of a session record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
	pub worktree_id: String,
	pub working_directory: PathBuf,
	pub phase: SessionPhase,
	pub is_processing: bool,
	pub messages: Vec<Message>,
	pub current_assistant_message_id: Option<String>,
	pub usage: UsageStats,
	pub last_error: Option<SessionError>,
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Test: two turns accumulate counters and keep only the last duration.
	///
	/// Why this test is important: usage must be monotonically non-decreasing
	/// across turns while `last_duration_ms` reflects only the latest turn.
	#[test]
	fn test_usage_accumulates_across_turns() {
		let mut usage = UsageStats::default();
		usage.accumulate(&UsageDelta {
			cost_usd: 0.25,
			input_tokens: 10,
			output_tokens: 5,
			turns: 2,
			duration_ms: Some(1200),
			..Default::default()
		});
		usage.accumulate(&UsageDelta {
			cost_usd: 0.5,
			input_tokens: 3,
			output_tokens: 7,
			cache_read_input_tokens: 4,
			turns: 1,
			duration_ms: Some(300),
			..Default::default()
		});

		assert_eq!(usage.input_tokens, 13);
		assert_eq!(usage.output_tokens, 12);
		assert_eq!(usage.cache_read_input_tokens, 4);
		assert_eq!(usage.total_turns, 3);
		assert_eq!(usage.last_duration_ms, Some(300));
		assert!((usage.total_cost_usd - 0.75).abs() < f64::EPSILON);
	}

	#[test]
	fn test_usage_ignores_missing_duration_and_bad_cost() {
		let mut usage = UsageStats::default();
		usage.accumulate(&UsageDelta {
			duration_ms: Some(50),
			..Default::default()
		});
		usage.accumulate(&UsageDelta {
			cost_usd: f64::NAN,
			..Default::default()
		});
		usage.accumulate(&UsageDelta {
			cost_usd: -1.0,
			..Default::default()
		});

		assert_eq!(usage.last_duration_ms, Some(50));
		assert_eq!(usage.total_cost_usd, 0.0);
	}

	#[test]
	fn test_assistant_placeholder_is_streaming() {
		let message = Message::assistant_placeholder();
		assert!(message.is_streaming);
		assert!(message.content.is_empty());
		assert_eq!(message.role, MessageRole::Assistant);
		assert_ne!(message.id, Message::assistant_placeholder().id);
	}

	#[test]
	fn test_tool_status_terminality() {
		assert!(!ToolCallStatus::Pending.is_terminal());
		assert!(!ToolCallStatus::Running.is_terminal());
		assert!(ToolCallStatus::Completed.is_terminal());
		assert!(ToolCallStatus::Error.is_terminal());
	}
}

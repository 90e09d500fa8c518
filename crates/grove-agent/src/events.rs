// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Domain events emitted by the orchestrator, each scoped by worktree id.

use serde::Serialize;

use crate::error::SessionError;
use crate::model::{Message, SessionPhase, ToolCall, UsageStats};

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
	/// Assistant text grew, or a message was added.
	MessageUpdated {
		worktree_id: String,
		message: Message,
	},
	/// The message stopped streaming. Emitted exactly once per assistant
	/// message.
	MessageFinalized {
		worktree_id: String,
		message: Message,
	},
	ToolCallUpdated {
		worktree_id: String,
		message_id: String,
		tool_call: ToolCall,
	},
	SessionError {
		worktree_id: String,
		error: SessionError,
	},
	UsageUpdated {
		worktree_id: String,
		usage: UsageStats,
	},
	SessionStateChanged {
		worktree_id: String,
		phase: SessionPhase,
	},
}

impl SessionEvent {
	pub fn worktree_id(&self) -> &str {
		match self {
			Self::MessageUpdated { worktree_id, .. }
			| Self::MessageFinalized { worktree_id, .. }
			| Self::ToolCallUpdated { worktree_id, .. }
			| Self::SessionError { worktree_id, .. }
			| Self::UsageUpdated { worktree_id, .. }
			| Self::SessionStateChanged { worktree_id, .. } => worktree_id,
		}
	}
}

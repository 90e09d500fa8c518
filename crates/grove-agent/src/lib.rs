// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent sessions for git worktrees.
//!
//! This crate provides:
//! - One agent CLI session per worktree, with spawn, abort and removal
//! - Incremental decoding of the agent's NDJSON output into messages,
//!   tool calls and usage
//! - Working directory, binary provenance and environment checks applied
//!   before anything is spawned
//! - Worktree discovery through `git worktree list`

pub mod config;
pub mod decoder;
pub mod env;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;
pub mod process;
pub mod protocol;
pub mod validate;
pub mod worktree;

pub use config::OrchestratorConfig;
pub use decoder::{StreamDecoder, StreamEffect};
pub use error::{
	ConfigError, ErrorKind, GitError, OrchestratorError, OrchestratorResult, PathError,
	SessionError, SessionErrorKind,
};
pub use events::SessionEvent;
pub use model::{
	Message, MessageRole, SessionPhase, SessionSnapshot, SessionStatus, ToolCall, ToolCallStatus,
	UsageStats,
};
pub use orchestrator::{SessionOrchestrator, TurnOutcome};
pub use worktree::{GitWorktreeRegistry, StaticWorktreeRegistry, WorktreeInfo, WorktreeRegistry};

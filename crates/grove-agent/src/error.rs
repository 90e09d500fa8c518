// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Coarse classification of synchronous orchestrator failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	/// Bad id, path, prompt or capacity. Nothing was mutated.
	Validation,
	/// The caller asked for something it is not allowed to run.
	Authorization,
}

/// Errors returned synchronously by the session orchestrator.
///
/// Process-level failures that happen after a prompt was accepted are not
/// represented here; they end up in [`SessionError`] instead.
#[derive(Error, Debug)]
pub enum OrchestratorError {
	#[error("worktree id must not be empty")]
	EmptyWorktreeId,

	#[error("invalid working directory: {0}")]
	InvalidPath(#[from] PathError),

	#[error("{} is not a registered worktree", .0.display())]
	UnknownWorktree(PathBuf),

	#[error("session limit reached ({max} active sessions)")]
	CapacityExceeded { max: usize },

	#[error("no session for worktree {0}")]
	SessionNotFound(String),

	#[error("prompt is empty")]
	EmptyPrompt,

	#[error("prompt is {len} characters, the limit is {max}")]
	PromptTooLong { len: usize, max: usize },

	#[error("session {0} is already processing a prompt")]
	AlreadyProcessing(String),

	#[error("no trusted agent binary found (checked {} candidates)", .0.len())]
	BinaryNotFound(Vec<PathBuf>),
}

impl OrchestratorError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::UnknownWorktree(_) | Self::BinaryNotFound(_) => ErrorKind::Authorization,
			_ => ErrorKind::Validation,
		}
	}
}

/// Reasons a raw working directory string is rejected.
#[derive(Error, Debug)]
pub enum PathError {
	#[error("path is empty")]
	Empty,

	#[error("path is {len} bytes, the limit is {max}")]
	TooLong { len: usize, max: usize },

	#[error("path contains a NUL byte")]
	ContainsNul,

	#[error("path is not absolute: {0}")]
	NotAbsolute(PathBuf),

	#[error("cannot canonicalize {path}: {source}")]
	Canonicalize {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("not a directory: {0}")]
	NotADirectory(PathBuf),
}

/// Errors from invoking the git CLI.
#[derive(Error, Debug)]
pub enum GitError {
	#[error("git is not installed")]
	GitNotInstalled,

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("{cmd} {} failed: {stderr}", args.join(" "))]
	CommandFailed {
		cmd: &'static str,
		args: Vec<String>,
		stderr: String,
	},
}

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("TOML parse error in {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("Invalid value for {field}: {message}")]
	InvalidValue { field: String, message: String },
}

impl ConfigError {
	pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
		Self::InvalidValue {
			field: field.into(),
			message: message.into(),
		}
	}
}

/// Category of a failure that happened while a turn was running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorKind {
	/// Spawn failure, pipe error, or an unexpected I/O failure.
	Transport,
	/// The agent CLI reported that it is not logged in.
	Authentication,
	/// The process exited non-zero or died without a terminal event.
	AbnormalTermination,
	/// The agent's own terminal event reported an error.
	Agent,
}

/// Session-scoped error recorded in `last_error` and emitted as an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionError {
	pub kind: SessionErrorKind,
	pub message: String,
}

impl SessionError {
	pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
		}
	}
}

impl std::fmt::Display for SessionError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

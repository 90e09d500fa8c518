// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Orchestrator configuration.
//!
//! Precedence, lowest first: built-in defaults, TOML file, `GROVE_*`
//! environment variables, then whatever the caller sets explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decoder::DEFAULT_MAX_LINE_BYTES;
use crate::error::ConfigError;

pub const DEFAULT_MAX_SESSIONS: usize = 16;
pub const DEFAULT_MAX_PROMPT_CHARS: usize = 100_000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Tools the agent may use without asking.
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
	"Read",
	"Edit",
	"MultiEdit",
	"Write",
	"Glob",
	"Grep",
	"LS",
	"Bash",
	"TodoWrite",
	"WebFetch",
	"WebSearch",
];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
	pub max_sessions: usize,
	pub max_prompt_chars: usize,
	pub shutdown_grace_ms: u64,
	/// Absolute paths tried in order. `~/` is expanded to the home directory.
	pub binary_candidates: Vec<PathBuf>,
	pub allowed_tools: Vec<String>,
	pub max_line_bytes: usize,
	pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		Self {
			max_sessions: DEFAULT_MAX_SESSIONS,
			max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
			shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
			binary_candidates: default_binary_candidates(),
			allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|s| s.to_string()).collect(),
			max_line_bytes: DEFAULT_MAX_LINE_BYTES,
			event_capacity: DEFAULT_EVENT_CAPACITY,
		}
	}
}

impl OrchestratorConfig {
	/// Defaults, overlaid with `path` if it exists, then the environment.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let mut config = match path {
			Some(path) if path.exists() => Self::from_file(path)?,
			_ => Self::default(),
		};
		config.apply_env(|key| std::env::var(key).ok())?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path)?;
		let config: Self = toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
			path: path.to_path_buf(),
			source,
		})?;
		tracing::debug!(path = %path.display(), "loaded config file");
		Ok(config)
	}

	/// Apply `GROVE_*` overrides read through `lookup`.
	pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		if let Some(value) = lookup("GROVE_MAX_SESSIONS") {
			self.max_sessions = parse_number("GROVE_MAX_SESSIONS", &value)?;
		}
		if let Some(value) = lookup("GROVE_MAX_PROMPT_CHARS") {
			self.max_prompt_chars = parse_number("GROVE_MAX_PROMPT_CHARS", &value)?;
		}
		if let Some(value) = lookup("GROVE_SHUTDOWN_GRACE_MS") {
			self.shutdown_grace_ms = parse_number("GROVE_SHUTDOWN_GRACE_MS", &value)?;
		}
		if let Some(value) = lookup("GROVE_AGENT_BINARY") {
			// Still subject to the trusted-binary check at resolve time.
			self.binary_candidates.insert(0, PathBuf::from(value));
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.max_sessions == 0 {
			return Err(ConfigError::invalid_value("max_sessions", "must be at least 1"));
		}
		if self.max_prompt_chars == 0 {
			return Err(ConfigError::invalid_value(
				"max_prompt_chars",
				"must be at least 1",
			));
		}
		if self.max_line_bytes == 0 {
			return Err(ConfigError::invalid_value("max_line_bytes", "must be at least 1"));
		}
		if self.event_capacity == 0 {
			return Err(ConfigError::invalid_value("event_capacity", "must be at least 1"));
		}
		if self.binary_candidates.is_empty() {
			return Err(ConfigError::invalid_value(
				"binary_candidates",
				"at least one candidate is required",
			));
		}
		if let Some(relative) = self
			.binary_candidates
			.iter()
			.map(|p| expand_home(p))
			.find(|p| !p.is_absolute())
		{
			return Err(ConfigError::invalid_value(
				"binary_candidates",
				format!("{} is not an absolute path", relative.display()),
			));
		}
		Ok(())
	}

	pub fn shutdown_grace(&self) -> Duration {
		Duration::from_millis(self.shutdown_grace_ms)
	}

	/// Candidates with `~/` expanded.
	pub fn resolved_binary_candidates(&self) -> Vec<PathBuf> {
		self.binary_candidates.iter().map(|p| expand_home(p)).collect()
	}

	/// Value for the agent's allowed-tools flag.
	pub fn allowed_tools_arg(&self) -> String {
		self.allowed_tools.join(",")
	}
}

/// Default location of the config file: `$XDG_CONFIG_HOME/grove/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("grove").join("config.toml"))
}

fn default_binary_candidates() -> Vec<PathBuf> {
	[
		"/usr/local/bin/claude",
		"/opt/homebrew/bin/claude",
		"/usr/bin/claude",
		"~/.claude/local/claude",
		"~/.local/bin/claude",
	]
	.iter()
	.map(PathBuf::from)
	.collect()
}

fn expand_home(path: &Path) -> PathBuf {
	match path.strip_prefix("~") {
		Ok(rest) => match dirs::home_dir() {
			Some(home) => home.join(rest),
			None => path.to_path_buf(),
		},
		Err(_) => path.to_path_buf(),
	}
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
	value
		.trim()
		.parse()
		.map_err(|_| ConfigError::invalid_value(field, format!("'{value}' is not a number")))
}

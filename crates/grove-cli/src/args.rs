// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run agent sessions in git worktrees
#[derive(Parser, Debug)]
#[command(name = "grove", version)]
pub struct Args {
	/// Config file (defaults to $XDG_CONFIG_HOME/grove/config.toml)
	#[arg(long, env = "GROVE_CONFIG", global = true)]
	pub config: Option<PathBuf>,

	/// Log filter used when RUST_LOG is unset
	#[arg(long, default_value = "warn", global = true)]
	pub log_level: String,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Send one prompt to the agent in a worktree, streaming events as NDJSON
	Run(RunArgs),

	/// List the worktrees of a repository
	Worktrees {
		/// Repository root (defaults to the current directory)
		#[arg(long)]
		repo: Option<PathBuf>,

		/// Print one JSON object per worktree
		#[arg(long)]
		json: bool,
	},

	/// Show the resolved agent binary and effective configuration
	Doctor,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
	/// Worktree to run the agent in
	pub worktree: PathBuf,

	/// Prompt text
	pub prompt: String,

	/// Session id (defaults to the worktree directory name)
	#[arg(long)]
	pub id: Option<String>,

	/// Repository whose worktrees are allowed (defaults to the worktree itself)
	#[arg(long)]
	pub repo: Option<PathBuf>,

	/// Agent binary to try before the built-in candidates
	#[arg(long)]
	pub binary: Option<PathBuf>,

	/// Grace period between SIGTERM and SIGKILL on abort
	#[arg(long)]
	pub shutdown_grace_ms: Option<u64>,

	/// Comma-separated tools the agent may use
	#[arg(long, value_delimiter = ',')]
	pub allowed_tools: Option<Vec<String>>,
}

impl RunArgs {
	pub fn session_id(&self) -> String {
		self.id.clone().unwrap_or_else(|| {
			self
				.worktree
				.file_name()
				.map(|n| n.to_string_lossy().to_string())
				.unwrap_or_else(|| "default".to_string())
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_run_parses_overrides() {
		let args = Args::try_parse_from([
			"grove",
			"run",
			"/src/app-feature",
			"fix the build",
			"--allowed-tools",
			"Read,Grep",
			"--shutdown-grace-ms",
			"100",
		])
		.unwrap();

		let Command::Run(run) = args.command else {
			panic!("expected run");
		};
		assert_eq!(run.session_id(), "app-feature");
		assert_eq!(run.prompt, "fix the build");
		assert_eq!(
			run.allowed_tools,
			Some(vec!["Read".to_string(), "Grep".to_string()])
		);
		assert_eq!(run.shutdown_grace_ms, Some(100));
	}

	#[test]
	fn test_explicit_id_wins() {
		let args = Args::try_parse_from(["grove", "run", "/src/x", "hi", "--id", "w1"]).unwrap();
		let Command::Run(run) = args.command else {
			panic!("expected run");
		};
		assert_eq!(run.session_id(), "w1");
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::error::GitError;

/// One entry of `git worktree list --porcelain`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorktreeInfo {
	pub path: PathBuf,
	pub head: Option<String>,
	/// Short branch name, `None` when detached or bare.
	pub branch: Option<String>,
	pub is_bare: bool,
	pub is_detached: bool,
	pub is_locked: bool,
	pub is_prunable: bool,
}

/// Source of truth for which directories may host an agent session.
#[async_trait]
pub trait WorktreeRegistry: Send + Sync {
	/// `path` is already canonicalized by the caller.
	async fn is_known_worktree_path(&self, path: &Path) -> bool;
}

/// Registry backed by the worktrees of one git repository.
///
/// The worktree list is re-read on every lookup so worktrees added or
/// removed while the orchestrator runs are picked up.
pub struct GitWorktreeRegistry {
	repo_root: PathBuf,
}

impl GitWorktreeRegistry {
	pub fn new(repo_root: impl Into<PathBuf>) -> Self {
		Self {
			repo_root: repo_root.into(),
		}
	}

	pub fn repo_root(&self) -> &Path {
		&self.repo_root
	}

	/// List all worktrees of the repository with canonicalized paths.
	///
	/// Entries whose directory no longer exists keep their raw path.
	pub async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
		let output = run_git(&self.repo_root, &["worktree", "list", "--porcelain"]).await?;
		let mut worktrees = parse_worktree_porcelain(&output);
		for worktree in &mut worktrees {
			if let Ok(canonical) = worktree.path.canonicalize() {
				worktree.path = canonical;
			}
		}

		debug!(
			repo = %self.repo_root.display(),
			count = worktrees.len(),
			"listed worktrees"
		);
		Ok(worktrees)
	}
}

#[async_trait]
impl WorktreeRegistry for GitWorktreeRegistry {
	async fn is_known_worktree_path(&self, path: &Path) -> bool {
		match self.list_worktrees().await {
			Ok(worktrees) => worktrees
				.iter()
				.any(|w| !w.is_bare && w.path.as_path() == path),
			Err(e) => {
				warn!(
					repo = %self.repo_root.display(),
					error = %e,
					"failed to list worktrees"
				);
				false
			}
		}
	}
}

/// Fixed set of worktree paths, for embedding callers that manage worktrees
/// themselves.
#[derive(Debug, Default)]
pub struct StaticWorktreeRegistry {
	paths: HashSet<PathBuf>,
}

impl StaticWorktreeRegistry {
	/// Paths that cannot be canonicalized are skipped.
	pub fn new<I, P>(paths: I) -> Self
	where
		I: IntoIterator<Item = P>,
		P: AsRef<Path>,
	{
		let paths = paths
			.into_iter()
			.filter_map(|p| p.as_ref().canonicalize().ok())
			.collect();
		Self { paths }
	}
}

#[async_trait]
impl WorktreeRegistry for StaticWorktreeRegistry {
	async fn is_known_worktree_path(&self, path: &Path) -> bool {
		self.paths.contains(path)
	}
}

/// Parses `git worktree list --porcelain` output.
pub fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeInfo> {
	let mut worktrees = Vec::new();
	let mut current: Option<WorktreeInfo> = None;

	for line in output.lines() {
		if let Some(path) = line.strip_prefix("worktree ") {
			if let Some(done) = current.take() {
				worktrees.push(done);
			}
			current = Some(WorktreeInfo {
				path: PathBuf::from(path),
				..Default::default()
			});
			continue;
		}

		let Some(worktree) = current.as_mut() else {
			continue;
		};

		if let Some(head) = line.strip_prefix("HEAD ") {
			worktree.head = Some(head.to_string());
		} else if let Some(branch) = line.strip_prefix("branch ") {
			let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
			worktree.branch = Some(short.to_string());
		} else if line == "bare" {
			worktree.is_bare = true;
		} else if line == "detached" {
			worktree.is_detached = true;
		} else if line == "locked" || line.starts_with("locked ") {
			worktree.is_locked = true;
		} else if line == "prunable" || line.starts_with("prunable ") {
			worktree.is_prunable = true;
		}
	}

	if let Some(done) = current.take() {
		worktrees.push(done);
	}
	worktrees
}

/// Runs a git command and returns the stdout on success.
async fn run_git(path: &Path, args: &[&str]) -> Result<String, GitError> {
	let mut cmd = Command::new("git");
	cmd.arg("-C").arg(path).args(args);

	trace!(
		cmd = %format!("git -C {} {}", path.display(), args.join(" ")),
		"running git command"
	);

	let output = cmd.output().await.map_err(|e| {
		if e.kind() == std::io::ErrorKind::NotFound {
			warn!("git not found in PATH");
			GitError::GitNotInstalled
		} else {
			GitError::Io(e)
		}
	})?;

	if output.status.success() {
		Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
	} else {
		let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
		Err(GitError::CommandFailed {
			cmd: "git",
			args: args.iter().map(|s| s.to_string()).collect(),
			stderr,
		})
	}
}

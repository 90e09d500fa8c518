// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod args;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use grove_agent::config::default_config_path;
use grove_agent::validate::resolve_agent_binary;
use grove_agent::{
	GitWorktreeRegistry, OrchestratorConfig, SessionEvent, SessionOrchestrator, TurnOutcome,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use args::{Args, Command, RunArgs};

#[tokio::main]
async fn main() -> Result<ExitCode> {
	let args = Args::parse();

	// stdout carries the event stream, so logs go to stderr.
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
		)
		.with_writer(std::io::stderr)
		.init();

	let config_path = args.config.clone().or_else(default_config_path);
	if let Some(path) = &args.config {
		if !path.exists() {
			bail!("config file not found: {}", path.display());
		}
	}

	match args.command {
		Command::Run(run_args) => {
			let config = load_config(config_path.as_deref(), Some(&run_args))?;
			run(config, run_args).await
		}
		Command::Worktrees { repo, json } => worktrees(repo, json).await,
		Command::Doctor => {
			let config = load_config(config_path.as_deref(), None)?;
			doctor(config_path.as_deref(), &config)
		}
	}
}

fn load_config(path: Option<&Path>, run_args: Option<&RunArgs>) -> Result<OrchestratorConfig> {
	let mut config = OrchestratorConfig::load(path).context("failed to load configuration")?;

	if let Some(run_args) = run_args {
		if let Some(binary) = &run_args.binary {
			config.binary_candidates.insert(0, binary.clone());
		}
		if let Some(grace) = run_args.shutdown_grace_ms {
			config.shutdown_grace_ms = grace;
		}
		if let Some(tools) = &run_args.allowed_tools {
			config.allowed_tools = tools.clone();
		}
		config.validate().context("invalid configuration")?;
	}
	Ok(config)
}

async fn run(config: OrchestratorConfig, run_args: RunArgs) -> Result<ExitCode> {
	let worktree = run_args
		.worktree
		.canonicalize()
		.with_context(|| format!("cannot resolve {}", run_args.worktree.display()))?;
	let worktree_str = worktree
		.to_str()
		.context("worktree path is not valid UTF-8")?
		.to_string();
	let repo = run_args.repo.clone().unwrap_or_else(|| worktree.clone());
	let id = run_args.session_id();

	let registry = GitWorktreeRegistry::new(repo);
	let orchestrator = Arc::new(SessionOrchestrator::new(config, Arc::new(registry)));
	let printer = tokio::spawn(print_events(orchestrator.subscribe()));

	orchestrator
		.create_session(&id, &worktree_str)
		.await
		.with_context(|| format!("cannot start a session in {worktree_str}"))?;

	let turn = {
		let orchestrator = orchestrator.clone();
		let id = id.clone();
		let prompt = run_args.prompt.clone();
		tokio::spawn(async move { orchestrator.send_message(&id, &prompt).await })
	};
	let abort_on_interrupt = {
		let orchestrator = orchestrator.clone();
		let id = id.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				info!("interrupted, aborting session");
				orchestrator.abort_session(&id).await;
			}
		})
	};

	let outcome = turn.await.context("turn task panicked")?;
	abort_on_interrupt.abort();
	orchestrator.shutdown().await;
	drop(orchestrator);
	// Drains buffered events; ends once the orchestrator is gone.
	let _ = printer.await;

	match outcome? {
		TurnOutcome::Completed => Ok(ExitCode::SUCCESS),
		TurnOutcome::Aborted => Ok(ExitCode::from(130)),
		TurnOutcome::Failed(error) => {
			eprintln!("error: {error}");
			Ok(ExitCode::FAILURE)
		}
	}
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
	loop {
		match events.recv().await {
			Ok(event) => {
				let line = match serde_json::to_string(&event) {
					Ok(line) => line,
					Err(e) => {
						warn!(error = %e, "failed to encode event");
						continue;
					}
				};
				let mut stdout = std::io::stdout().lock();
				if writeln!(stdout, "{line}").and_then(|_| stdout.flush()).is_err() {
					break;
				}
			}
			Err(broadcast::error::RecvError::Lagged(skipped)) => {
				warn!(skipped, "event printer fell behind");
			}
			Err(broadcast::error::RecvError::Closed) => break,
		}
	}
}

async fn worktrees(repo: Option<PathBuf>, json: bool) -> Result<ExitCode> {
	let repo = match repo {
		Some(repo) => repo,
		None => std::env::current_dir().context("cannot determine current directory")?,
	};
	let registry = GitWorktreeRegistry::new(repo);
	let worktrees = registry.list_worktrees().await?;

	let mut stdout = std::io::stdout().lock();
	for worktree in &worktrees {
		if json {
			writeln!(stdout, "{}", serde_json::to_string(worktree)?)?;
			continue;
		}
		let label = match (&worktree.branch, worktree.is_bare, worktree.is_detached) {
			(_, true, _) => "(bare)".to_string(),
			(Some(branch), _, _) => format!("[{branch}]"),
			(None, _, true) => "(detached HEAD)".to_string(),
			(None, _, _) => String::new(),
		};
		let head = worktree
			.head
			.as_deref()
			.map(|h| &h[..h.len().min(7)])
			.unwrap_or("");
		writeln!(stdout, "{}  {head}  {label}", worktree.path.display())?;
	}
	Ok(ExitCode::SUCCESS)
}

fn doctor(config_path: Option<&Path>, config: &OrchestratorConfig) -> Result<ExitCode> {
	match config_path {
		Some(path) if path.exists() => println!("config file: {}", path.display()),
		Some(path) => println!("config file: {} (not present, using defaults)", path.display()),
		None => println!("config file: none"),
	}

	let candidates = config.resolved_binary_candidates();
	let found = match resolve_agent_binary(&candidates) {
		Ok(binary) => {
			println!("agent binary: {}", binary.display());
			true
		}
		Err(_) => {
			println!("agent binary: not found");
			for candidate in &candidates {
				println!("  checked {}", candidate.display());
			}
			false
		}
	};

	println!();
	print!(
		"{}",
		toml::to_string_pretty(config).context("failed to render configuration")?
	);

	Ok(if found {
		ExitCode::SUCCESS
	} else {
		ExitCode::FAILURE
	})
}

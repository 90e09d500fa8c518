// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Path, binary and prompt validation.
//!
//! Everything that crosses the trust boundary between the caller and the
//! agent process goes through here: the working directory the agent runs in,
//! the executable that gets spawned, and the prompt text passed on its
//! command line.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{OrchestratorError, PathError};

/// Longest raw working directory string accepted, in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// Validate and canonicalize a caller-supplied working directory.
///
/// The returned path is absolute, has symlinks resolved and `.`/`..`
/// removed, and points at an existing directory.
pub fn validate_working_directory(raw: &str) -> Result<PathBuf, PathError> {
	if raw.is_empty() {
		return Err(PathError::Empty);
	}
	if raw.len() > MAX_PATH_LEN {
		return Err(PathError::TooLong {
			len: raw.len(),
			max: MAX_PATH_LEN,
		});
	}
	if raw.contains('\0') {
		return Err(PathError::ContainsNul);
	}

	let path = Path::new(raw);
	if !path.is_absolute() {
		return Err(PathError::NotAbsolute(path.to_path_buf()));
	}

	let canonical = path
		.canonicalize()
		.map_err(|source| PathError::Canonicalize {
			path: path.to_path_buf(),
			source,
		})?;

	if !canonical.is_dir() {
		return Err(PathError::NotADirectory(canonical));
	}

	debug!(raw = %raw, canonical = %canonical.display(), "validated working directory");
	Ok(canonical)
}

/// Returns true only if `path` is safe to execute as the agent binary.
///
/// The path must name a regular file (symlinks, directories and devices are
/// refused), be executable by the current user, and be owned by root or by
/// the effective user of this process.
pub fn verify_trusted_binary(path: &Path) -> bool {
	if !path.is_absolute() {
		debug!(path = %path.display(), "binary path is not absolute");
		return false;
	}

	let metadata = match std::fs::symlink_metadata(path) {
		Ok(metadata) => metadata,
		Err(e) => {
			debug!(path = %path.display(), error = %e, "binary candidate not found");
			return false;
		}
	};

	if !metadata.file_type().is_file() {
		warn!(path = %path.display(), "binary candidate is not a regular file");
		return false;
	}

	#[cfg(unix)]
	{
		use std::os::unix::fs::{MetadataExt, PermissionsExt};

		let owner = metadata.uid();
		let euid = unsafe { libc::geteuid() };
		if owner != 0 && owner != euid {
			warn!(
				path = %path.display(),
				owner,
				euid,
				"binary candidate owned by an untrusted user"
			);
			return false;
		}

		if metadata.permissions().mode() & 0o111 == 0 || !is_executable_by_current_user(path) {
			warn!(path = %path.display(), "binary candidate is not executable");
			return false;
		}
	}

	true
}

#[cfg(unix)]
fn is_executable_by_current_user(path: &Path) -> bool {
	use std::ffi::CString;
	use std::os::unix::ffi::OsStrExt;

	let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
		return false;
	};
	unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 }
}

/// Pick the first trusted agent binary from a fixed candidate list.
///
/// `PATH` is deliberately never consulted.
pub fn resolve_agent_binary(candidates: &[PathBuf]) -> Result<PathBuf, OrchestratorError> {
	for candidate in candidates {
		if verify_trusted_binary(candidate) {
			debug!(path = %candidate.display(), "resolved agent binary");
			return Ok(candidate.clone());
		}
	}

	warn!(
		candidates = ?candidates.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
		"no trusted agent binary found"
	);
	Err(OrchestratorError::BinaryNotFound(candidates.to_vec()))
}

/// Reject prompts that are empty or longer than `max_chars`.
pub fn check_prompt(text: &str, max_chars: usize) -> Result<(), OrchestratorError> {
	if text.trim().is_empty() {
		return Err(OrchestratorError::EmptyPrompt);
	}
	let len = text.chars().count();
	if len > max_chars {
		return Err(OrchestratorError::PromptTooLong {
			len,
			max: max_chars,
		});
	}
	Ok(())
}

/// Strip control characters other than newline and tab, then truncate to
/// `max_chars` characters.
pub fn sanitize_prompt(text: &str, max_chars: usize) -> String {
	text
		.chars()
		.filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
		.take(max_chars)
		.collect()
}

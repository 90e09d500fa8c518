// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Allow-listed environment for agent child processes.

use std::collections::BTreeMap;
use std::ffi::OsString;

/// Variables copied from the host environment into the agent's environment.
///
/// HOME, USER and LOGNAME are needed by the agent CLI to find its stored
/// credentials and config.
pub const ALLOWED_ENV_VARS: &[&str] = &[
	"PATH", "HOME", "USER", "LOGNAME", "LANG", "LC_ALL", "LC_CTYPE", "TERM", "TMPDIR",
];

pub type EnvMap = BTreeMap<OsString, OsString>;

/// Build the environment for an agent process from this process's
/// environment.
pub fn build_child_environment() -> EnvMap {
	filter_environment(std::env::vars_os())
}

/// Keep only allow-listed variables from `vars`.
pub fn filter_environment<I>(vars: I) -> EnvMap
where
	I: IntoIterator<Item = (OsString, OsString)>,
{
	vars
		.into_iter()
		.filter(|(key, _)| {
			key
				.to_str()
				.map(|k| ALLOWED_ENV_VARS.contains(&k))
				.unwrap_or(false)
		})
		.collect()
}

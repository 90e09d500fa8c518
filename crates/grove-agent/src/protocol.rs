// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Wire types for the agent CLI's `stream-json` output.
//!
//! One record per line, discriminated by `type`. Only the fields the
//! orchestrator acts on are modelled; everything else is ignored by serde.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// A single decoded NDJSON record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRecord {
	/// Session init and other informational records.
	System,
	Assistant(MessageRecord),
	/// Carries tool results back to the model.
	User(MessageRecord),
	Result(ResultRecord),
	/// Any record type this decoder does not act on.
	#[serde(other)]
	Ignored,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageRecord {
	pub message: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct MessageBody {
	#[serde(default, deserialize_with = "null_as_default")]
	pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
	Text {
		#[serde(default, deserialize_with = "null_as_default")]
		text: String,
	},
	ToolUse {
		id: Option<String>,
		name: Option<String>,
		#[serde(default)]
		input: Value,
	},
	ToolResult {
		tool_use_id: Option<String>,
		#[serde(default)]
		content: Value,
		#[serde(default, deserialize_with = "null_as_default")]
		is_error: bool,
	},
	#[serde(other)]
	Other,
}

/// Terminal record of a turn.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ResultRecord {
	#[serde(default)]
	pub subtype: Option<String>,
	#[serde(default, deserialize_with = "null_as_default")]
	pub is_error: bool,
	#[serde(default)]
	pub result: Option<String>,
	#[serde(default)]
	pub total_cost_usd: Option<f64>,
	#[serde(default)]
	pub num_turns: Option<u64>,
	#[serde(default)]
	pub duration_ms: Option<u64>,
	#[serde(default)]
	pub usage: Option<ResultUsage>,
}

impl ResultRecord {
	pub fn is_success(&self) -> bool {
		!self.is_error && self.subtype.as_deref().unwrap_or("success") == "success"
	}
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ResultUsage {
	#[serde(default, deserialize_with = "null_as_default")]
	pub input_tokens: u64,
	#[serde(default, deserialize_with = "null_as_default")]
	pub output_tokens: u64,
	#[serde(default, deserialize_with = "null_as_default")]
	pub cache_creation_input_tokens: u64,
	#[serde(default, deserialize_with = "null_as_default")]
	pub cache_read_input_tokens: u64,
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: Default + Deserialize<'de>,
{
	Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Flatten a `tool_result` content payload into a single string.
///
/// Strings are used as-is; arrays keep only their `text` sub-blocks, joined
/// with newlines. Anything else yields an empty string.
pub fn tool_result_text(content: &Value) -> String {
	match content {
		Value::String(s) => s.clone(),
		Value::Array(blocks) => blocks
			.iter()
			.filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
			.filter_map(|b| b.get("text").and_then(Value::as_str))
			.collect::<Vec<_>>()
			.join("\n"),
		_ => String::new(),
	}
}

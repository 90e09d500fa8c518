// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! NDJSON stream decoding.
//!
//! [`LineBuffer`] turns arbitrarily chunked stdout bytes into complete lines,
//! and [`StreamDecoder`] turns those lines into [`StreamEffect`]s in the order
//! they were read. Malformed lines are dropped without affecting the rest of
//! the stream.

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::model::UsageDelta;
use crate::protocol::{tool_result_text, ContentBlock, ResultRecord, StreamRecord};

/// Default ceiling for a single line, in bytes.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// What a decoded record asks the session to do.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEffect {
	/// Append text to the in-flight assistant message.
	AppendText(String),
	/// A new tool call started running.
	ToolCallStarted {
		id: String,
		name: String,
		input: Value,
	},
	/// A tool call produced its result.
	ToolCallFinished {
		id: String,
		output: String,
		is_error: bool,
	},
	/// The turn's terminal record.
	TurnFinished(TurnResult),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnResult {
	pub success: bool,
	/// Text to surface inline when the turn failed.
	pub error_text: Option<String>,
	pub usage: UsageDelta,
}

/// Accumulates bytes and yields complete, trimmed, non-empty lines.
#[derive(Debug)]
pub struct LineBuffer {
	pending: Vec<u8>,
	max_line_bytes: usize,
	/// Set while skipping the remainder of an oversized line.
	discarding: bool,
}

impl Default for LineBuffer {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_LINE_BYTES)
	}
}

impl LineBuffer {
	pub fn new(max_line_bytes: usize) -> Self {
		Self {
			pending: Vec::new(),
			max_line_bytes,
			discarding: false,
		}
	}

	/// Feed a chunk and return every line it completed, left to right.
	pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
		let mut lines = Vec::new();
		let mut rest = chunk;

		while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
			if self.discarding {
				self.discarding = false;
				self.pending.clear();
			} else {
				self.pending.extend_from_slice(&rest[..pos]);
				if self.pending.len() > self.max_line_bytes {
					warn!(
						len = self.pending.len(),
						max = self.max_line_bytes,
						"dropping oversized stream line"
					);
					self.pending.clear();
				} else if let Some(line) = self.take_line() {
					lines.push(line);
				}
			}
			rest = &rest[pos + 1..];
		}

		if !self.discarding {
			self.pending.extend_from_slice(rest);
			if self.pending.len() > self.max_line_bytes {
				warn!(
					len = self.pending.len(),
					max = self.max_line_bytes,
					"dropping oversized stream line"
				);
				self.pending.clear();
				self.discarding = true;
			}
		}

		lines
	}

	/// Flush the residual at end of stream. A process may exit without
	/// writing a trailing newline.
	pub fn finish(&mut self) -> Option<String> {
		if std::mem::take(&mut self.discarding) {
			self.pending.clear();
			return None;
		}
		self.take_line()
	}

	fn take_line(&mut self) -> Option<String> {
		let bytes = std::mem::take(&mut self.pending);
		let line = String::from_utf8_lossy(&bytes).trim().to_string();
		if line.is_empty() {
			None
		} else {
			Some(line)
		}
	}
}

/// Per-session decoder from raw stdout bytes to effects.
#[derive(Debug, Default)]
pub struct StreamDecoder {
	lines: LineBuffer,
}

impl StreamDecoder {
	pub fn new(max_line_bytes: usize) -> Self {
		Self {
			lines: LineBuffer::new(max_line_bytes),
		}
	}

	pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEffect> {
		self
			.lines
			.push(chunk)
			.iter()
			.filter_map(|line| decode_line(line))
			.flat_map(interpret)
			.collect()
	}

	pub fn finish(&mut self) -> Vec<StreamEffect> {
		self
			.lines
			.finish()
			.and_then(|line| decode_line(&line))
			.map(interpret)
			.unwrap_or_default()
	}
}

/// Parse one line. Returns `None` for anything that is not a well-formed
/// record.
pub fn decode_line(line: &str) -> Option<StreamRecord> {
	match serde_json::from_str::<StreamRecord>(line) {
		Ok(record) => {
			trace!(?record, "decoded stream record");
			Some(record)
		}
		Err(e) => {
			debug!(error = %e, len = line.len(), "skipping undecodable stream line");
			None
		}
	}
}

/// Map a record to the effects it implies.
pub fn interpret(record: StreamRecord) -> Vec<StreamEffect> {
	match record {
		StreamRecord::System | StreamRecord::Ignored => Vec::new(),
		StreamRecord::Assistant(record) => record
			.message
			.content
			.into_iter()
			.filter_map(|block| match block {
				ContentBlock::Text { text } if !text.is_empty() => Some(StreamEffect::AppendText(text)),
				ContentBlock::ToolUse {
					id: Some(id),
					name: Some(name),
					input,
				} => Some(StreamEffect::ToolCallStarted { id, name, input }),
				_ => None,
			})
			.collect(),
		StreamRecord::User(record) => record
			.message
			.content
			.into_iter()
			.filter_map(|block| match block {
				ContentBlock::ToolResult {
					tool_use_id: Some(id),
					content,
					is_error,
				} => Some(StreamEffect::ToolCallFinished {
					id,
					output: tool_result_text(&content),
					is_error,
				}),
				_ => None,
			})
			.collect(),
		StreamRecord::Result(result) => vec![StreamEffect::TurnFinished(turn_result(&result))],
	}
}

fn turn_result(result: &ResultRecord) -> TurnResult {
	let success = result.is_success();
	let error_text = if success {
		None
	} else {
		Some(
			result
				.result
				.clone()
				.filter(|text| !text.trim().is_empty())
				.unwrap_or_else(|| {
					format!(
						"Agent reported an error ({})",
						result.subtype.as_deref().unwrap_or("unknown")
					)
				}),
		)
	};

	let usage = result.usage.clone().unwrap_or_default();
	TurnResult {
		success,
		error_text,
		usage: UsageDelta {
			cost_usd: result.total_cost_usd.unwrap_or(0.0),
			input_tokens: usage.input_tokens,
			output_tokens: usage.output_tokens,
			cache_creation_input_tokens: usage.cache_creation_input_tokens,
			cache_read_input_tokens: usage.cache_read_input_tokens,
			turns: result.num_turns.unwrap_or(0),
			duration_ms: result.duration_ms,
		},
	}
}

#![forbid(unsafe_code)]

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Liveness ping/pong body, sent and echoed verbatim.
pub const KEEPALIVE: &str = "{}";

/// Split a physical payload into top-level JSON object slices.
///
/// Objects may be joined with or without whitespace. Braces inside string
/// literals are ignored. A trailing unbalanced fragment is dropped; text
/// between objects is skipped.
pub fn split_frames(payload: &str) -> Vec<&str> {
	let mut out = Vec::new();
	let mut depth: usize = 0;
	let mut start: Option<usize> = None;
	let mut in_string = false;
	let mut escaped = false;

	for (i, ch) in payload.char_indices() {
		if in_string {
			if escaped {
				escaped = false;
			} else if ch == '\\' {
				escaped = true;
			} else if ch == '"' {
				in_string = false;
			}
			continue;
		}

		match ch {
			'"' if depth > 0 => in_string = true,
			'{' => {
				if depth == 0 {
					start = Some(i);
				}
				depth += 1;
			}
			'}' if depth > 0 => {
				depth -= 1;
				if depth == 0
					&& let Some(s) = start.take()
				{
					out.push(&payload[s..=i]);
				}
			}
			_ => {}
		}
	}

	out
}

/// One logical inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
	/// Empty object ping.
	Keepalive,

	/// Reply to the connect command.
	Connected { id: Option<u64>, client: Option<String> },

	/// Subscription confirmation.
	Subscribed { id: Option<u64> },

	/// Error reply to any command.
	Error { id: Option<u64>, code: u32, message: String },

	/// Channel publication.
	Push { channel: String, data: serde_json::Value },

	/// Well-formed but irrelevant (unsubscribe, join/leave, bare replies).
	Other,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
	#[serde(default)]
	id: Option<u64>,
	#[serde(default)]
	connect: Option<RawConnect>,
	#[serde(default)]
	subscribe: Option<serde_json::Value>,
	#[serde(default)]
	error: Option<RawError>,
	#[serde(default)]
	push: Option<RawPush>,
	#[serde(flatten)]
	rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawConnect {
	#[serde(default)]
	client: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawError {
	#[serde(default)]
	code: u32,
	#[serde(default)]
	message: String,
}

#[derive(Debug, Deserialize)]
struct RawPush {
	#[serde(default)]
	channel: String,
	#[serde(default, rename = "pub")]
	publication: Option<RawPublication>,
}

#[derive(Debug, Deserialize)]
struct RawPublication {
	#[serde(default)]
	data: serde_json::Value,
}

/// Decode one logical frame (a slice from [`split_frames`]).
pub fn parse_frame(raw: &str) -> anyhow::Result<InboundFrame> {
	let frame: RawFrame = serde_json::from_str(raw).context("parse pub/sub frame")?;

	if let Some(err) = frame.error {
		return Ok(InboundFrame::Error {
			id: frame.id,
			code: err.code,
			message: err.message,
		});
	}
	if let Some(connect) = frame.connect {
		return Ok(InboundFrame::Connected {
			id: frame.id,
			client: connect.client,
		});
	}
	if frame.subscribe.is_some() {
		return Ok(InboundFrame::Subscribed { id: frame.id });
	}
	if let Some(push) = frame.push {
		return Ok(match push.publication {
			Some(p) if !p.data.is_null() => InboundFrame::Push {
				channel: push.channel,
				data: p.data,
			},
			_ => InboundFrame::Other,
		});
	}
	if frame.id.is_none() && frame.rest.is_empty() {
		return Ok(InboundFrame::Keepalive);
	}
	Ok(InboundFrame::Other)
}

/// Decode every well-formed frame in a physical payload, dropping bad fragments.
pub fn decode_payload(payload: &str) -> Vec<InboundFrame> {
	split_frames(payload)
		.into_iter()
		.filter_map(|raw| match parse_frame(raw) {
			Ok(frame) => Some(frame),
			Err(e) => {
				tracing::debug!(error = %e, len = raw.len(), "dropping malformed fragment");
				None
			}
		})
		.collect()
}

/// Channel name without its `@<id>` scope.
pub fn channel_base(channel: &str) -> &str {
	channel.split_once('@').map(|(base, _)| base).unwrap_or(channel)
}

#[derive(Debug, Serialize)]
struct Command<'a> {
	id: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	connect: Option<ConnectRequest<'a>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	subscribe: Option<SubscribeRequest<'a>>,
}

#[derive(Debug, Serialize)]
struct ConnectRequest<'a> {
	token: &'a str,
	name: &'a str,
}

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
	channel: &'a str,
}

/// Client name announced in the connect command.
pub const CLIENT_NAME: &str = "js";

pub fn connect_command(id: u64, token: &str) -> anyhow::Result<String> {
	serde_json::to_string(&Command {
		id,
		connect: Some(ConnectRequest {
			token,
			name: CLIENT_NAME,
		}),
		subscribe: None,
	})
	.context("encode connect command")
}

pub fn subscribe_command(id: u64, channel: &str) -> anyhow::Result<String> {
	serde_json::to_string(&Command {
		id,
		connect: None,
		subscribe: Some(SubscribeRequest { channel }),
	})
	.context("encode subscribe command")
}

/// Monotonic command id source, one per connection.
#[derive(Debug, Default)]
pub struct CommandIds(u64);

impl CommandIds {
	pub fn next_id(&mut self) -> u64 {
		self.0 += 1;
		self.0
	}
}

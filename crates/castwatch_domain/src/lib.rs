#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "errors", derive(thiserror::Error))]
pub enum ParseIdError {
	#[cfg_attr(feature = "errors", error("empty value"))]
	Empty,
	#[cfg_attr(feature = "errors", error("unknown value: {0}"))]
	Unknown(String),
	#[cfg_attr(feature = "errors", error("invalid format: {0}"))]
	InvalidFormat(String),
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
		#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id (surrounding whitespace is trimmed).
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				let trimmed = id.trim();
				if trimmed.is_empty() {
					return Err(ParseIdError::Empty);
				}
				if trimmed.len() == id.len() {
					Ok(Self(id))
				} else {
					Ok(Self(trimmed.to_string()))
				}
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Provider-facing cast name (the username used in lookups).
	CastName
);

string_id!(
	/// Owning account identifier.
	AccountId
);

/// Numeric provider channel identifier (the `modelId` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct ChannelId(u64);

impl ChannelId {
	pub const fn new(id: u64) -> Self {
		Self(id)
	}

	pub const fn get(self) -> u64 {
		self.0
	}

	/// Channel name scoped to this id, e.g. `newChatMessage@178845750`.
	pub fn scoped(self, channel: &str) -> String {
		format!("{channel}@{}", self.0)
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<u64>()
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("channel id must be numeric: {s}")))
	}
}

/// Globally unique broadcast session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}

	/// Short prefix for log lines.
	pub fn short(&self) -> String {
		let s = self.0.simple().to_string();
		s[..8].to_string()
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for SessionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Whether a cast belongs to the operator or is observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum CastSource {
	#[default]
	Owned,
	Observed,
}

impl CastSource {
	pub const fn as_str(self) -> &'static str {
		match self {
			CastSource::Owned => "owned",
			CastSource::Observed => "observed",
		}
	}
}

impl fmt::Display for CastSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for CastSource {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match s.to_ascii_lowercase().as_str() {
			"owned" | "own" | "registered" => Ok(CastSource::Owned),
			"observed" | "spy" | "competitor" => Ok(CastSource::Observed),
			other => Err(ParseIdError::Unknown(other.to_string())),
		}
	}
}

/// A monitored broadcast source.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Cast {
	pub name: CastName,
	pub account_id: AccountId,
	pub display_name: Option<String>,
	/// Resolved lazily from status lookups; `None` until known.
	pub channel_id: Option<ChannelId>,
	pub source: CastSource,
}

impl Cast {
	pub fn new(name: CastName, account_id: AccountId) -> Self {
		Self {
			name,
			account_id,
			display_name: None,
			channel_id: None,
			source: CastSource::Owned,
		}
	}

	pub fn with_source(mut self, source: CastSource) -> Self {
		self.source = source;
		self
	}

	pub fn with_channel_id(mut self, channel_id: ChannelId) -> Self {
		self.channel_id = Some(channel_id);
		self
	}

	pub fn display(&self) -> &str {
		self.display_name
			.as_deref()
			.filter(|s| !s.trim().is_empty())
			.unwrap_or(self.name.as_str())
	}
}

/// Poller classification of one cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum LivenessStatus {
	#[default]
	Idle,
	Live,
	Error,
}

impl LivenessStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			LivenessStatus::Idle => "idle",
			LivenessStatus::Live => "live",
			LivenessStatus::Error => "error",
		}
	}

	pub const fn is_live(self) -> bool {
		matches!(self, LivenessStatus::Live)
	}
}

impl fmt::Display for LivenessStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Kind of an ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum EventKind {
	Chat,
	Tip,
	System,
}

impl EventKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::Chat => "chat",
			EventKind::Tip => "tip",
			EventKind::System => "system",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EventKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"chat" => Ok(EventKind::Chat),
			"tip" => Ok(EventKind::Tip),
			"system" => Ok(EventKind::System),
			other => Err(ParseIdError::Unknown(other.to_string())),
		}
	}
}

#![forbid(unsafe_code)]

pub mod buffer;
pub mod chat;
pub mod client;
pub mod frames;

#[cfg(test)]
mod tests;

use castwatch_domain::ChannelId;

pub use buffer::{EventBuffer, FlushOutcome, flush};
pub use client::{ClientState, IngestionClient, IngestionConfig, IngestionTarget, WsConnector};

pub const DEFAULT_WS_URL: &str = "wss://websocket-sp-v6.stripchat.com/connection/websocket";

/// Channel names subscribed per cast, scoped as `{name}@{channelId}`.
pub const DEFAULT_CHANNELS: [&str; 4] = ["newChatMessage", "newModelEvent", "clearChatMessages", "userUpdated"];

/// Close/error codes that mean the token was rejected.
pub const DEFAULT_AUTH_ERROR_CODES: [u32; 1] = [3501];

/// What a channel carries, keyed by its unscoped name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
	Chat,
	ModelEvent,
	ClearChat,
	UserUpdated,
	Unknown,
}

impl ChannelKind {
	pub fn from_base(base: &str) -> Self {
		match base {
			"newChatMessage" => Self::Chat,
			"newModelEvent" => Self::ModelEvent,
			"clearChatMessages" => Self::ClearChat,
			"userUpdated" => Self::UserUpdated,
			_ => Self::Unknown,
		}
	}
}

/// Scoped channel list for one cast.
pub fn subscription_set<S: AsRef<str>>(channels: &[S], channel_id: ChannelId) -> Vec<String> {
	channels.iter().map(|c| channel_id.scoped(c.as_ref())).collect()
}

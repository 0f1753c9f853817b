#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::{Notifier, SecretString};

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for ch in s.chars() {
		match ch {
			'&' => out.push_str("&amp;"),
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			other => out.push(other),
		}
	}
	out
}

/// Logs messages instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
	async fn notify(&self, message: &str) {
		info!(target: "castwatch::notify", "{message}");
	}
}

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Telegram `sendMessage` delivery (HTML parse mode).
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
	api_base: String,
	bot_token: SecretString,
	chat_id: String,
	client: reqwest::Client,
}

#[derive(Debug, serde::Serialize)]
struct SendMessageRequest<'a> {
	chat_id: &'a str,
	text: &'a str,
	parse_mode: &'static str,
}

impl TelegramNotifier {
	pub fn new(bot_token: SecretString, chat_id: impl Into<String>) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(10))
			.build()
			.context("build telegram http client")?;
		Ok(Self {
			api_base: TELEGRAM_API_BASE.to_string(),
			bot_token,
			chat_id: chat_id.into(),
			client,
		})
	}

	async fn send(&self, message: &str) -> anyhow::Result<()> {
		let url = format!(
			"{}/bot{}/sendMessage",
			self.api_base.trim_end_matches('/'),
			self.bot_token.expose()
		);
		let resp = self
			.client
			.post(url)
			.json(&SendMessageRequest {
				chat_id: &self.chat_id,
				text: message,
				parse_mode: "HTML",
			})
			.send()
			.await
			.context("telegram sendMessage")?;

		if !resp.status().is_success() {
			anyhow::bail!("telegram sendMessage failed: status={}", resp.status());
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
	async fn notify(&self, message: &str) {
		metrics::counter!("castwatch_notifications_total").increment(1);
		if let Err(e) = self.send(message).await {
			warn!(error = %e, "notification delivery failed");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn escapes_markup() {
		assert_eq!(escape_html("a<b> & c"), "a&lt;b&gt; &amp; c");
	}
}

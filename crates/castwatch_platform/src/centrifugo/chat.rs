#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use castwatch_domain::{AccountId, CastName, EventKind, SessionId};
use serde::{Deserialize, Deserializer};
use serde_json::json;

use crate::CastEvent;

/// Tip total at or above which a sender is treated as VIP.
pub const VIP_TOKEN_THRESHOLD: u64 = 1000;

/// `tip` if the amount is positive or the payload marks it as a tip.
pub fn classify_tip(amount: u64, type_marker: &str) -> EventKind {
	if amount > 0 || type_marker.eq_ignore_ascii_case("tip") {
		EventKind::Tip
	} else {
		EventKind::Chat
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatPayload {
	#[serde(default)]
	message: Option<ChatMessageBody>,
	#[serde(default, deserialize_with = "lenient_string")]
	username: Option<String>,
	#[serde(default, deserialize_with = "lenient_u64")]
	tokens: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessageBody {
	#[serde(default, deserialize_with = "lenient_string")]
	id: Option<String>,
	#[serde(default, deserialize_with = "null_as_default")]
	user_data: UserData,
	#[serde(default, deserialize_with = "null_as_default")]
	details: Details,
	#[serde(default, rename = "type", deserialize_with = "lenient_string")]
	kind: Option<String>,
	#[serde(default)]
	created_at: Option<serde_json::Value>,
	#[serde(default, deserialize_with = "null_as_default")]
	additional_data: AdditionalData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserData {
	#[serde(default, deserialize_with = "lenient_string")]
	username: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	screen_name: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	id: Option<String>,
	#[serde(default, deserialize_with = "strict_true")]
	is_model: bool,
	#[serde(default, deserialize_with = "strict_true")]
	is_fan_club_member: bool,
	#[serde(default, deserialize_with = "null_as_default")]
	user_ranking: Ranking,
}

#[derive(Debug, Default, Deserialize)]
struct Ranking {
	#[serde(default, deserialize_with = "lenient_string")]
	league: Option<String>,
	#[serde(default, deserialize_with = "lenient_u64")]
	level: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Details {
	#[serde(default, deserialize_with = "lenient_string")]
	body: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	text: Option<String>,
	#[serde(default, deserialize_with = "lenient_u64")]
	amount: u64,
	#[serde(default, deserialize_with = "lenient_u64")]
	fan_club_number_months_of_subscribed: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdditionalData {
	#[serde(default, deserialize_with = "strict_true")]
	is_king: bool,
	#[serde(default, deserialize_with = "strict_true")]
	is_knight: bool,
}

/// A decoded chat or tip message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
	/// Provider message id, when the payload carries one.
	pub message_id: Option<String>,
	pub kind: EventKind,
	pub user_name: String,
	pub user_id: Option<String>,
	pub body: String,
	pub tokens: u64,
	pub created_at_ms: Option<i64>,
	pub league: Option<String>,
	pub level: Option<u32>,
	pub is_model: bool,
	pub is_king: bool,
	pub is_knight: bool,
	pub is_fan_club: bool,
	pub is_vip: bool,
}

/// Decode a chat-channel publication. Payloads without a message or sender are rejected.
pub fn parse_chat(data: &serde_json::Value) -> anyhow::Result<ChatEvent> {
	let payload = ChatPayload::deserialize(data).context("decode chat payload")?;
	let message = payload.message.ok_or_else(|| anyhow!("chat payload without message"))?;

	let user_name = non_blank(message.user_data.username)
		.or_else(|| non_blank(message.user_data.screen_name))
		.or_else(|| non_blank(payload.username))
		.ok_or_else(|| anyhow!("chat payload without sender"))?;

	let body = non_blank(message.details.body)
		.or(message.details.text)
		.unwrap_or_default();
	let tokens = if message.details.amount > 0 {
		message.details.amount
	} else {
		payload.tokens
	};
	let kind = classify_tip(tokens, message.kind.as_deref().unwrap_or_default());

	let is_king = message.additional_data.is_king;
	let is_knight = message.additional_data.is_knight;
	let is_fan_club =
		message.details.fan_club_number_months_of_subscribed > 0 || message.user_data.is_fan_club_member;
	let level = u32::try_from(message.user_data.user_ranking.level)
		.ok()
		.filter(|l| *l > 0);

	Ok(ChatEvent {
		message_id: non_blank(message.id),
		kind,
		user_name,
		user_id: non_blank(message.user_data.id),
		body,
		tokens,
		created_at_ms: message.created_at.as_ref().and_then(timestamp_ms),
		league: non_blank(message.user_data.user_ranking.league),
		level,
		is_model: message.user_data.is_model,
		is_king,
		is_knight,
		is_fan_club,
		is_vip: tokens >= VIP_TOKEN_THRESHOLD || is_king || is_knight,
	})
}

impl ChatEvent {
	pub fn into_event(
		self,
		cast: &CastName,
		account_id: &AccountId,
		session_id: Option<SessionId>,
		channel: &str,
		received_ms: i64,
		wire_id: String,
	) -> CastEvent {
		let metadata = json!({
			"source": "castwatch",
			"channel": channel,
			"isModel": self.is_model,
			"isKing": self.is_king,
			"isKnight": self.is_knight,
			"isFanClub": self.is_fan_club,
			"providerUserId": self.user_id,
		});
		CastEvent {
			cast: cast.clone(),
			account_id: account_id.clone(),
			session_id,
			message_time_ms: self.created_at_ms.unwrap_or(received_ms),
			kind: self.kind,
			user_name: self.user_name,
			user_id: self.user_id,
			body: self.body,
			tokens: self.tokens,
			is_vip: self.is_vip,
			user_league: self.league,
			user_level: self.level,
			metadata,
			wire_id,
		}
	}
}

#[derive(Debug, Default, Deserialize)]
struct ModelEventPayload {
	#[serde(default, deserialize_with = "lenient_string")]
	event: Option<String>,
	#[serde(default, rename = "type", deserialize_with = "lenient_string")]
	kind: Option<String>,
}

/// Raw event-type string of a lifecycle publication (`unknown` when absent).
pub fn model_event_type(data: &serde_json::Value) -> String {
	let payload = ModelEventPayload::deserialize(data).unwrap_or_default();
	non_blank(payload.event)
		.or_else(|| non_blank(payload.kind))
		.unwrap_or_else(|| "unknown".to_string())
}

/// Build the `system` event for a lifecycle publication.
pub fn system_event(
	event_type: String,
	cast: &CastName,
	account_id: &AccountId,
	session_id: Option<SessionId>,
	channel: &str,
	received_ms: i64,
	wire_id: String,
) -> CastEvent {
	CastEvent {
		cast: cast.clone(),
		account_id: account_id.clone(),
		session_id,
		message_time_ms: received_ms,
		kind: EventKind::System,
		user_name: "system".to_string(),
		user_id: None,
		metadata: json!({ "source": "castwatch", "channel": channel, "event": event_type }),
		body: event_type,
		tokens: 0,
		is_vip: false,
		user_league: None,
		user_level: None,
		wire_id,
	}
}

fn non_blank(s: Option<String>) -> Option<String> {
	s.filter(|s| !s.trim().is_empty())
}

fn timestamp_ms(v: &serde_json::Value) -> Option<i64> {
	match v {
		serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s.trim())
			.ok()
			.map(|dt| dt.timestamp_millis()),
		serde_json::Value::Number(n) => {
			let n = n.as_i64()?;
			// seconds vs milliseconds
			Some(if n < 100_000_000_000 { n * 1000 } else { n })
		}
		_ => None,
	}
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
	D: Deserializer<'de>,
{
	let v = serde_json::Value::deserialize(deserializer)?;
	Ok(match v {
		serde_json::Value::Number(n) => n
			.as_u64()
			.or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
			.unwrap_or(0),
		serde_json::Value::String(s) => s.trim().parse::<u64>().unwrap_or(0),
		_ => 0,
	})
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
	D: Deserializer<'de>,
{
	let v = serde_json::Value::deserialize(deserializer)?;
	Ok(match v {
		serde_json::Value::String(s) => Some(s),
		serde_json::Value::Number(n) => Some(n.to_string()),
		_ => None,
	})
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: Deserialize<'de> + Default,
{
	Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn strict_true<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
	D: Deserializer<'de>,
{
	let v = serde_json::Value::deserialize(deserializer)?;
	Ok(matches!(v, serde_json::Value::Bool(true)))
}

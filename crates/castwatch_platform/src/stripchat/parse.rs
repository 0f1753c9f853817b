#![forbid(unsafe_code)]

use castwatch_domain::ChannelId;
use serde::{Deserialize, Deserializer};

use crate::centrifugo::frames::split_frames;
use crate::{PayerEntry, ProviderError, StatusReport, ViewerEntry};

/// Max nesting searched for a token in the REST config document.
pub const TOKEN_SEARCH_DEPTH: usize = 5;

const TOKEN_KEY: &str = "centrifugoToken";

#[derive(Debug, Deserialize)]
struct CamResponse {
	#[serde(default)]
	user: Option<CamUserOuter>,
}

#[derive(Debug, Deserialize)]
struct CamUserOuter {
	#[serde(default)]
	user: Option<CamUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CamUser {
	#[serde(default)]
	status: Option<String>,
	#[serde(default, deserialize_with = "lenient_u64_opt")]
	id: Option<u64>,
	#[serde(default, deserialize_with = "lenient_u64_opt")]
	viewers_count: Option<u64>,
}

/// Decode the `/cam` lookup body into a status report.
pub fn parse_cam_status(body: &str) -> Result<StatusReport, ProviderError> {
	let resp: CamResponse = serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
	let user = resp
		.user
		.and_then(|u| u.user)
		.ok_or_else(|| ProviderError::Decode("missing user.user".to_string()))?;

	Ok(StatusReport {
		status: user
			.status
			.filter(|s| !s.trim().is_empty())
			.unwrap_or_else(|| "unknown".to_string()),
		channel_id: user.id.filter(|id| *id > 0).map(ChannelId::new),
		viewers: user
			.viewers_count
			.map(|v| u32::try_from(v).unwrap_or(u32::MAX))
			.unwrap_or(0),
	})
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MembersResponse {
	List(Vec<serde_json::Value>),
	Wrapped {
		#[serde(default)]
		members: Option<Vec<serde_json::Value>>,
		#[serde(default)]
		users: Option<Vec<serde_json::Value>>,
	},
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Member {
	#[serde(default, deserialize_with = "lenient_string")]
	username: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	user_name: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	name: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	id: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	user_id: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	league: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	user_league: Option<String>,
	#[serde(default, deserialize_with = "lenient_u64_opt")]
	level: Option<u64>,
	#[serde(default, deserialize_with = "lenient_u64_opt")]
	user_level: Option<u64>,
	#[serde(default)]
	is_fan_club: Option<bool>,
	#[serde(default)]
	fan_club: Option<bool>,
}

/// Decode the viewer list. Entries without any usable name are skipped.
pub fn parse_viewers(body: &str) -> Result<Vec<ViewerEntry>, ProviderError> {
	let resp: MembersResponse = serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
	let raw = match resp {
		MembersResponse::List(list) => list,
		MembersResponse::Wrapped { members, users } => members.filter(|m| !m.is_empty()).or(users).unwrap_or_default(),
	};

	Ok(raw
		.into_iter()
		.filter_map(|v| Member::deserialize(v).ok())
		.filter_map(|m| {
			let user_name = non_blank(m.username)
				.or_else(|| non_blank(m.user_name))
				.or_else(|| non_blank(m.name))?;
			Some(ViewerEntry {
				user_name,
				user_id: non_blank(m.id).or_else(|| non_blank(m.user_id)),
				league: non_blank(m.league).or_else(|| non_blank(m.user_league)),
				level: m
					.level
					.or(m.user_level)
					.and_then(|l| u32::try_from(l).ok())
					.filter(|l| *l > 0),
				is_fan_club: m.is_fan_club.or(m.fan_club).unwrap_or(false),
			})
		})
		.collect())
}

#[derive(Debug, Deserialize)]
struct PayersResponse {
	#[serde(default)]
	transactions: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payer {
	#[serde(default, deserialize_with = "lenient_string")]
	user_name: Option<String>,
	#[serde(default, deserialize_with = "lenient_u64_opt")]
	total_tokens: Option<u64>,
	#[serde(default, deserialize_with = "lenient_string")]
	last_paid: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	user_id: Option<String>,
}

/// Decode one page of the payer list. Rows without a user name are skipped.
pub fn parse_payers(body: &str) -> Result<Vec<PayerEntry>, ProviderError> {
	let resp: PayersResponse = serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
	Ok(resp
		.transactions
		.into_iter()
		.filter_map(|v| Payer::deserialize(v).ok())
		.filter_map(|p| {
			Some(PayerEntry {
				user_name: non_blank(p.user_name)?,
				user_id: non_blank(p.user_id),
				total_tokens: p.total_tokens.unwrap_or(0),
				last_paid: non_blank(p.last_paid),
			})
		})
		.collect())
}

/// The `window.__PRELOADED_STATE__ = {...};` object embedded in a page.
pub fn extract_preloaded_state(html: &str) -> Option<serde_json::Value> {
	let marker = "window.__PRELOADED_STATE__";
	let at = html.find(marker)? + marker.len();
	let rest = html[at..].trim_start().strip_prefix('=')?;
	let first = split_frames(rest.trim_start()).into_iter().next()?;
	serde_json::from_str(first).ok()
}

/// Token from the preloaded state (`config`, `configV3`, then `user`).
pub fn preloaded_token(state: &serde_json::Value) -> Option<String> {
	["config", "configV3", "user"].iter().find_map(|section| {
		state
			.get(section)
			.and_then(|s| s.get(TOKEN_KEY))
			.and_then(|t| t.as_str())
			.map(str::trim)
			.filter(|t| !t.is_empty())
			.map(str::to_string)
	})
}

/// Depth-limited search for a string value under `key`.
pub fn deep_find_str(value: &serde_json::Value, key: &str, depth: usize) -> Option<String> {
	if depth > TOKEN_SEARCH_DEPTH {
		return None;
	}
	let obj = value.as_object()?;
	if let Some(s) = obj.get(key).and_then(|v| v.as_str())
		&& !s.trim().is_empty()
	{
		return Some(s.to_string());
	}
	obj.values()
		.filter(|v| v.is_object())
		.find_map(|v| deep_find_str(v, key, depth + 1))
}

pub fn config_token(config: &serde_json::Value) -> Option<String> {
	deep_find_str(config, TOKEN_KEY, 0)
}

/// `cf_clearance` value from a `Set-Cookie` header, if that is the cookie it sets.
pub fn clearance_from_set_cookie(header: &str) -> Option<String> {
	header
		.split(';')
		.map(str::trim)
		.find_map(|part| part.strip_prefix("cf_clearance="))
		.filter(|v| !v.is_empty())
		.map(str::to_string)
}

fn non_blank(s: Option<String>) -> Option<String> {
	s.filter(|s| !s.trim().is_empty())
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

fn lenient_u64_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
	D: Deserializer<'de>,
{
	let v = serde_json::Value::deserialize(deserializer)?;
	Ok(match v {
		serde_json::Value::Number(n) => n.as_u64(),
		serde_json::Value::String(s) => s.trim().parse().ok(),
		_ => None,
	})
}

#![forbid(unsafe_code)]

pub mod centrifugo;
pub mod notify;
pub mod stripchat;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use castwatch_domain::{AccountId, Cast, CastName, ChannelId, EventKind, LivenessStatus, SessionId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Bearer token plus the cookies the pub/sub endpoint expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
	pub token: SecretString,

	/// Edge-proxy clearance cookie value (`cf_clearance`).
	pub clearance: Option<SecretString>,

	/// Raw `name=value; name=value` cookie blob.
	pub cookies: Option<SecretString>,
}

impl Credential {
	pub fn new(token: impl Into<String>) -> Self {
		Self {
			token: SecretString::new(token),
			clearance: None,
			cookies: None,
		}
	}

	pub fn with_clearance(mut self, clearance: impl Into<String>) -> Self {
		let clearance = SecretString::new(clearance);
		self.clearance = (!clearance.is_blank()).then_some(clearance);
		self
	}

	pub fn with_cookies(mut self, cookies: impl Into<String>) -> Self {
		let cookies = SecretString::new(cookies);
		self.cookies = (!cookies.is_blank()).then_some(cookies);
		self
	}

	pub fn has_token(&self) -> bool {
		!self.token.is_blank()
	}

	/// `Cookie` header value, if any cookie is known.
	pub fn cookie_header(&self) -> Option<String> {
		let mut parts: Vec<String> = Vec::new();
		if let Some(c) = &self.clearance {
			parts.push(format!("cf_clearance={}", c.expose().trim()));
		}
		if let Some(blob) = &self.cookies {
			for part in blob.expose().split(';').map(str::trim).filter(|p| !p.is_empty()) {
				if self.clearance.is_some() && part.starts_with("cf_clearance=") {
					continue;
				}
				parts.push(part.to_string());
			}
		}
		(!parts.is_empty()).then(|| parts.join("; "))
	}
}

/// Typed failures from provider REST lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
	#[error("not found")]
	NotFound,
	#[error("rate limited")]
	RateLimited,
	#[error("unauthorized")]
	Unauthorized,
	#[error("unexpected status {0}")]
	Status(u16),
	#[error("transport: {0}")]
	Transport(String),
	#[error("decode: {0}")]
	Decode(String),
}

impl ProviderError {
	pub fn from_status(code: u16) -> Self {
		match code {
			404 => Self::NotFound,
			429 => Self::RateLimited,
			401 | 403 => Self::Unauthorized,
			other => Self::Status(other),
		}
	}

	pub fn label(&self) -> &'static str {
		match self {
			Self::NotFound => "not_found",
			Self::RateLimited => "rate_limited",
			Self::Unauthorized => "unauthorized",
			Self::Status(_) => "status",
			Self::Transport(_) => "transport",
			Self::Decode(_) => "decode",
		}
	}
}

/// Result of one status lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
	/// Provider status string (`public`, `off`, `private`, `p2p`, ...).
	pub status: String,
	pub channel_id: Option<ChannelId>,
	pub viewers: u32,
}

impl StatusReport {
	/// Only a public broadcast counts as live.
	pub fn liveness(&self) -> LivenessStatus {
		if self.status.eq_ignore_ascii_case("public") {
			LivenessStatus::Live
		} else {
			LivenessStatus::Idle
		}
	}
}

/// One member of a cast's viewer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewerEntry {
	pub user_name: String,
	pub user_id: Option<String>,
	pub league: Option<String>,
	pub level: Option<u32>,
	pub is_fan_club: bool,
}

/// One row of an account's payer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayerEntry {
	pub user_name: String,
	pub user_id: Option<String>,
	pub total_tokens: u64,
	pub last_paid: Option<String>,
}

/// One ingested chat/tip/system event, ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct CastEvent {
	pub cast: CastName,
	pub account_id: AccountId,

	/// `None` only for arrivals outside an open session.
	pub session_id: Option<SessionId>,

	/// Payload timestamp (Unix ms), falling back to receipt time.
	pub message_time_ms: i64,

	pub kind: EventKind,
	pub user_name: String,
	pub user_id: Option<String>,
	pub body: String,

	/// Tip amount; 0 for non-tip events.
	pub tokens: u64,

	pub is_vip: bool,
	pub user_league: Option<String>,
	pub user_level: Option<u32>,
	pub metadata: serde_json::Value,

	/// Identity of the wire event: the provider message id, or the ingesting
	/// client's instance plus its receive ordinal. Requeued events keep it.
	pub wire_id: String,
}

impl CastEvent {
	/// Idempotency key for persistence. Two events share it only when they are
	/// the same wire event, never because their content matches.
	pub fn dedup_key(&self) -> String {
		let mut hasher = Sha256::new();
		hasher.update(self.cast.as_str().as_bytes());
		hasher.update([0]);
		hasher.update(self.wire_id.as_bytes());
		hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
	}
}

/// Session-start fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
	pub id: SessionId,
	pub cast: CastName,
	pub account_id: AccountId,
	pub started_at_ms: i64,
}

/// Aggregates written when a session is finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionAggregates {
	pub message_count: u64,
	pub tip_total: u64,
	pub peak_viewers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerSnapshot {
	pub cast: CastName,
	pub account_id: AccountId,
	pub session_id: Option<SessionId>,
	pub taken_at_ms: i64,
	pub viewers: Vec<ViewerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRecord {
	pub cast: CastName,
	pub account_id: AccountId,
	pub session_id: Option<SessionId>,
	pub url: String,
	pub captured_at_ms: i64,
}

/// Persistent store seam. Only single-row atomicity is assumed across calls.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
	async fn insert_session(&self, session: &SessionRecord) -> anyhow::Result<()>;

	async fn finalize_session(&self, id: SessionId, ended_at_ms: i64, aggregates: SessionAggregates)
	-> anyhow::Result<()>;

	/// Persist one chunk of events. Returns the number of newly stored rows.
	async fn insert_events_batch(&self, events: &[CastEvent]) -> anyhow::Result<u64>;

	/// Best-effort count of events stored for a session.
	async fn query_event_count(&self, id: SessionId) -> anyhow::Result<u64>;

	async fn load_casts(&self) -> anyhow::Result<Vec<Cast>>;

	async fn upsert_cast(&self, cast: &Cast) -> anyhow::Result<()>;

	async fn save_channel_id(&self, cast: &CastName, channel_id: ChannelId) -> anyhow::Result<()>;

	async fn touch_cast_online(&self, cast: &CastName, at_ms: i64) -> anyhow::Result<()>;

	/// Close every session left open. Returns how many were closed.
	async fn close_orphan_sessions(&self, ended_at_ms: i64) -> anyhow::Result<u64>;

	async fn record_viewers(&self, snapshot: &ViewerSnapshot) -> anyhow::Result<()>;

	async fn upsert_payers(&self, account: &AccountId, payers: &[PayerEntry]) -> anyhow::Result<u64>;

	async fn insert_thumbnail(&self, thumbnail: &ThumbnailRecord) -> anyhow::Result<()>;
}

/// Fire-and-forget message delivery. Implementations log and swallow failures.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync + 'static {
	async fn notify(&self, message: &str);
}

/// Supplies fresh credentials on demand.
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync + 'static {
	async fn fetch_credential(&self) -> anyhow::Result<Credential>;
}

/// Provider REST lookups used by the poller and the auxiliary fetchers.
#[async_trait::async_trait]
pub trait ProviderApi: Send + Sync + 'static {
	async fn cam_status(&self, cast: &CastName, credential: &Credential) -> Result<StatusReport, ProviderError>;

	async fn viewers(&self, cast: &CastName, credential: &Credential) -> Result<Vec<ViewerEntry>, ProviderError>;

	async fn payers_page(
		&self,
		provider_user_id: &str,
		offset: u32,
		limit: u32,
		credential: &Credential,
	) -> Result<Vec<PayerEntry>, ProviderError>;

	fn thumbnail_url(&self, channel_id: ChannelId) -> String;
}

/// Level-triggered single-slot signal. Concurrent raises collapse into one wakeup.
#[derive(Debug, Default)]
pub struct RefreshSignal {
	raised: AtomicBool,
	notify: Notify,
}

impl RefreshSignal {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn raise(&self) {
		self.raised.store(true, Ordering::Release);
		self.notify.notify_waiters();
	}

	pub fn is_raised(&self) -> bool {
		self.raised.load(Ordering::Acquire)
	}

	/// Drop a pending raise without waking anyone.
	pub fn clear(&self) {
		self.raised.store(false, Ordering::Release);
	}

	/// Wait until raised, then consume the flag.
	pub async fn wait(&self) {
		loop {
			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if self.raised.swap(false, Ordering::AcqRel) {
				return;
			}
			notified.await;
		}
	}
}

/// Wall clock as Unix milliseconds.
pub fn unix_ms_now() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::time::Duration;

	use super::*;

	fn event(body: &str, tokens: u64) -> CastEvent {
		CastEvent {
			wire_id: format!("msg:{body}:{tokens}"),
			cast: CastName::new("risa").unwrap(),
			account_id: AccountId::new("acc").unwrap(),
			session_id: None,
			message_time_ms: 1_700_000_000_000,
			kind: if tokens > 0 { EventKind::Tip } else { EventKind::Chat },
			user_name: "viewer".to_string(),
			user_id: None,
			body: body.to_string(),
			tokens,
			is_vip: false,
			user_league: None,
			user_level: None,
			metadata: serde_json::Value::Null,
		}
	}

	#[test]
	fn secret_string_redacts() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert!(!format!("{s:?}").contains("hunter2"));
	}

	#[test]
	fn cookie_header_merges_clearance_and_blob() {
		let cred = Credential::new("jwt")
			.with_clearance("cf")
			.with_cookies("a=1; cf_clearance=old; b=2");
		assert_eq!(cred.cookie_header().as_deref(), Some("cf_clearance=cf; a=1; b=2"));

		let bare = Credential::new("jwt").with_clearance("  ");
		assert_eq!(bare.cookie_header(), None);
		assert!(bare.has_token());
	}

	#[test]
	fn status_classification() {
		let mut r = StatusReport {
			status: "public".to_string(),
			channel_id: None,
			viewers: 3,
		};
		assert_eq!(r.liveness(), LivenessStatus::Live);
		r.status = "private".to_string();
		assert_eq!(r.liveness(), LivenessStatus::Idle);
	}

	#[test]
	fn provider_error_from_status() {
		assert_eq!(ProviderError::from_status(404), ProviderError::NotFound);
		assert_eq!(ProviderError::from_status(403), ProviderError::Unauthorized);
		assert_eq!(ProviderError::from_status(502), ProviderError::Status(502));
	}

	#[test]
	fn dedup_key_follows_wire_identity() {
		let a = event("hello", 0);
		assert_eq!(a.dedup_key(), a.clone().dedup_key());
		assert_eq!(a.dedup_key().len(), 64);

		// session tagging must not change identity
		let mut tagged = a.clone();
		tagged.session_id = Some(SessionId::new_v4());
		assert_eq!(a.dedup_key(), tagged.dedup_key());

		// same content, different wire event
		let mut twin = a.clone();
		twin.wire_id = "other-client:0".to_string();
		assert_ne!(a.dedup_key(), twin.dedup_key());

		let mut elsewhere = a.clone();
		elsewhere.cast = CastName::new("rival").unwrap();
		assert_ne!(a.dedup_key(), elsewhere.dedup_key());
	}

	#[tokio::test]
	async fn refresh_signal_collapses_raises() {
		let signal = Arc::new(RefreshSignal::new());
		signal.raise();
		signal.raise();
		signal.raise();

		tokio::time::timeout(Duration::from_secs(1), signal.wait())
			.await
			.expect("first wait returns");
		assert!(!signal.is_raised());

		let second = tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
		assert!(second.is_err(), "collapsed raises must not wake twice");
	}

	#[tokio::test]
	async fn refresh_signal_wakes_pending_waiter() {
		let signal = Arc::new(RefreshSignal::new());
		let waiter = {
			let signal = signal.clone();
			tokio::spawn(async move { signal.wait().await })
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		signal.raise();
		tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.expect("waiter woke")
			.expect("join");
	}
}

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use castwatch_domain::{AccountId, Cast, CastName, SessionId};
use castwatch_platform::centrifugo::IngestionClient;
use castwatch_platform::centrifugo::chat::system_event;
use castwatch_platform::notify::escape_html;
use castwatch_platform::{Notifier, SessionAggregates, SessionRecord, Store};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Running totals read from an ingestion client at teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCounters {
	pub message_count: u64,
	pub tip_total: u64,
}

impl ClientCounters {
	pub fn of(client: &IngestionClient) -> Self {
		Self {
			message_count: client.message_count(),
			tip_total: client.tip_total(),
		}
	}
}

#[derive(Debug, Clone)]
struct OpenSession {
	id: SessionId,
	account_id: AccountId,
	started_at_ms: i64,
	marker_stored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedSession {
	pub id: SessionId,
	pub cast: CastName,
	pub account_id: AccountId,
	pub started_at_ms: i64,
	pub ended_at_ms: i64,
	pub aggregates: SessionAggregates,

	/// Store-side count of ingested events, lifecycle markers excluded, when the
	/// query succeeded.
	pub stored_events: Option<u64>,
}

impl FinalizedSession {
	pub fn duration_minutes(&self) -> i64 {
		(self.ended_at_ms - self.started_at_ms).max(0) / 60_000
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleMarker {
	Started,
	Ended,
}

impl LifecycleMarker {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Started => "broadcast_started",
			Self::Ended => "broadcast_ended",
		}
	}
}

/// Opens and closes broadcast sessions, at most one per cast.
pub struct SessionTracker {
	store: Arc<dyn Store>,
	notifier: Arc<dyn Notifier>,
	open: Mutex<HashMap<CastName, OpenSession>>,
}

impl SessionTracker {
	pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
		Self {
			store,
			notifier,
			open: Mutex::new(HashMap::new()),
		}
	}

	pub fn open_session(&self, cast: &CastName) -> Option<SessionId> {
		self.open.lock().get(cast).map(|s| s.id)
	}

	pub fn account_of(&self, cast: &CastName) -> Option<AccountId> {
		self.open.lock().get(cast).map(|s| s.account_id.clone())
	}

	pub fn open_casts(&self) -> Vec<CastName> {
		let mut casts: Vec<_> = self.open.lock().keys().cloned().collect();
		casts.sort();
		casts
	}

	pub fn open_count(&self) -> usize {
		self.open.lock().len()
	}

	/// Start a session for `cast`. `announce` is false on cold start.
	///
	/// A session that is already open is returned as is. A failed store insert is logged;
	/// the id stays valid for tagging events.
	pub async fn open(&self, cast: &Cast, started_at_ms: i64, announce: bool) -> SessionId {
		let record = {
			let mut open = self.open.lock();
			if let Some(existing) = open.get(&cast.name) {
				warn!(cast = %cast.name, session = %existing.id, "session already open; keeping it");
				return existing.id;
			}
			let session = OpenSession {
				id: SessionId::new_v4(),
				account_id: cast.account_id.clone(),
				started_at_ms,
				marker_stored: false,
			};
			open.insert(cast.name.clone(), session.clone());
			SessionRecord {
				id: session.id,
				cast: cast.name.clone(),
				account_id: session.account_id,
				started_at_ms,
			}
		};

		if let Err(e) = self.store.insert_session(&record).await {
			warn!(cast = %cast.name, session = %record.id, error = %e, "failed to record session start");
		}
		if self
			.store_marker(&cast.name, &record.account_id, record.id, LifecycleMarker::Started, started_at_ms)
			.await
			&& let Some(open) = self.open.lock().get_mut(&cast.name)
			&& open.id == record.id
		{
			open.marker_stored = true;
		}
		metrics::counter!("castwatch_sessions_opened_total").increment(1);
		info!(cast = %cast.name, session = %record.id, announce, "session opened");

		if announce {
			self.notifier
				.notify(&format!("🟢 <b>{}</b> started broadcasting", escape_html(cast.display())))
				.await;
		}
		record.id
	}

	/// Write a `system` event marking a session boundary. Returns whether it landed.
	async fn store_marker(
		&self,
		cast: &CastName,
		account_id: &AccountId,
		session: SessionId,
		marker: LifecycleMarker,
		at_ms: i64,
	) -> bool {
		let event = system_event(
			marker.as_str().to_string(),
			cast,
			account_id,
			Some(session),
			"session",
			at_ms,
			format!("session:{session}:{}", marker.as_str()),
		);
		match self.store.insert_events_batch(std::slice::from_ref(&event)).await {
			Ok(_) => true,
			Err(e) => {
				warn!(%cast, %session, marker = marker.as_str(), error = %e, "failed to store lifecycle marker");
				false
			}
		}
	}

	/// Close the open session for `cast`.
	///
	/// Client counters win over the store count; the store count only fills in
	/// the message total when no client ran. Returns `None` when nothing was open.
	pub async fn finalize(
		&self,
		cast: &Cast,
		ended_at_ms: i64,
		counters: Option<ClientCounters>,
		peak_viewers: u32,
	) -> Option<FinalizedSession> {
		let Some(session) = self.open.lock().remove(&cast.name) else {
			debug!(cast = %cast.name, "finalize without an open session; ignoring");
			return None;
		};

		let stored_events = match self.store.query_event_count(session.id).await {
			Ok(n) => Some(n.saturating_sub(u64::from(session.marker_stored))),
			Err(e) => {
				warn!(cast = %cast.name, session = %session.id, error = %e, "event count query failed");
				None
			}
		};

		let aggregates = SessionAggregates {
			message_count: counters
				.map(|c| c.message_count)
				.or(stored_events)
				.unwrap_or(0),
			tip_total: counters.map(|c| c.tip_total).unwrap_or(0),
			peak_viewers,
		};
		self.store_marker(&cast.name, &session.account_id, session.id, LifecycleMarker::Ended, ended_at_ms)
			.await;
		if let Err(e) = self.store.finalize_session(session.id, ended_at_ms, aggregates).await {
			warn!(cast = %cast.name, session = %session.id, error = %e, "failed to finalize session");
		}
		metrics::counter!("castwatch_sessions_finalized_total").increment(1);

		let finalized = FinalizedSession {
			id: session.id,
			cast: cast.name.clone(),
			account_id: session.account_id,
			started_at_ms: session.started_at_ms,
			ended_at_ms,
			aggregates,
			stored_events,
		};
		info!(
			cast = %cast.name,
			session = %finalized.id,
			minutes = finalized.duration_minutes(),
			messages = aggregates.message_count,
			tips = aggregates.tip_total,
			peak = aggregates.peak_viewers,
			"session finalized"
		);

		self.notifier
			.notify(&format!(
				"🔴 <b>{}</b> ended broadcasting\n⏱ {} min / 💬 {} messages / 👥 peak {} / 💰 {} tk",
				escape_html(cast.display()),
				finalized.duration_minutes(),
				aggregates.message_count,
				aggregates.peak_viewers,
				aggregates.tip_total,
			))
			.await;
		Some(finalized)
	}
}

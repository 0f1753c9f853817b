#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::anyhow;
use castwatch_domain::{AccountId, Cast, CastName, ChannelId, SessionId};
use castwatch_platform::{
	CastEvent, PayerEntry, SessionAggregates, SessionRecord, Store, ThumbnailRecord, ViewerSnapshot,
};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
	pub record: SessionRecord,
	pub ended_at_ms: Option<i64>,
	pub aggregates: SessionAggregates,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerRow {
	pub user_id: Option<String>,
	pub league: Option<String>,
	pub level: Option<u32>,
	pub is_fan_club: bool,
	pub first_seen_ms: i64,
	pub last_seen_ms: i64,
	pub visit_count: u32,
}

pub type ViewerKey = (AccountId, CastName, String, Option<SessionId>);

#[derive(Default)]
struct Inner {
	casts: BTreeMap<CastName, Cast>,
	last_online: HashMap<CastName, i64>,
	sessions: HashMap<SessionId, StoredSession>,
	events: Vec<CastEvent>,
	event_keys: HashSet<String>,
	viewers: HashMap<ViewerKey, ViewerRow>,
	payers: BTreeMap<(AccountId, String), PayerEntry>,
	thumbnails: Vec<ThumbnailRecord>,
}

/// In-process store for dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn casts(&self) -> Vec<Cast> {
		self.inner.lock().casts.values().cloned().collect()
	}

	pub fn last_online(&self, cast: &CastName) -> Option<i64> {
		self.inner.lock().last_online.get(cast).copied()
	}

	pub fn sessions(&self) -> Vec<StoredSession> {
		let mut out: Vec<_> = self.inner.lock().sessions.values().cloned().collect();
		out.sort_by_key(|s| s.record.started_at_ms);
		out
	}

	pub fn session(&self, id: SessionId) -> Option<StoredSession> {
		self.inner.lock().sessions.get(&id).cloned()
	}

	pub fn open_sessions(&self) -> Vec<StoredSession> {
		self.sessions().into_iter().filter(|s| s.ended_at_ms.is_none()).collect()
	}

	pub fn events(&self) -> Vec<CastEvent> {
		self.inner.lock().events.clone()
	}

	pub fn viewer_rows(&self) -> Vec<(ViewerKey, ViewerRow)> {
		self.inner
			.lock()
			.viewers
			.iter()
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect()
	}

	pub fn payers(&self, account: &AccountId) -> Vec<PayerEntry> {
		self.inner
			.lock()
			.payers
			.iter()
			.filter(|((a, _), _)| a == account)
			.map(|(_, p)| p.clone())
			.collect()
	}

	pub fn thumbnails(&self) -> Vec<ThumbnailRecord> {
		self.inner.lock().thumbnails.clone()
	}
}

#[async_trait::async_trait]
impl Store for MemoryStore {
	async fn insert_session(&self, session: &SessionRecord) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		if inner.sessions.contains_key(&session.id) {
			return Err(anyhow!("session {} already exists", session.id));
		}
		inner.sessions.insert(
			session.id,
			StoredSession {
				record: session.clone(),
				ended_at_ms: None,
				aggregates: SessionAggregates::default(),
			},
		);
		Ok(())
	}

	async fn finalize_session(&self, id: SessionId, ended_at_ms: i64, aggregates: SessionAggregates) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		let session = inner
			.sessions
			.get_mut(&id)
			.ok_or_else(|| anyhow!("session {id} not found"))?;
		if session.ended_at_ms.is_none() {
			session.ended_at_ms = Some(ended_at_ms);
			session.aggregates = aggregates;
		}
		Ok(())
	}

	async fn insert_events_batch(&self, events: &[CastEvent]) -> anyhow::Result<u64> {
		let mut inner = self.inner.lock();
		let mut inserted = 0;
		for event in events {
			if inner.event_keys.insert(event.dedup_key()) {
				inner.events.push(event.clone());
				inserted += 1;
			}
		}
		Ok(inserted)
	}

	async fn query_event_count(&self, id: SessionId) -> anyhow::Result<u64> {
		Ok(self
			.inner
			.lock()
			.events
			.iter()
			.filter(|e| e.session_id == Some(id))
			.count() as u64)
	}

	async fn load_casts(&self) -> anyhow::Result<Vec<Cast>> {
		Ok(self.casts())
	}

	async fn upsert_cast(&self, cast: &Cast) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		let known_channel = inner.casts.get(&cast.name).and_then(|c| c.channel_id);
		let mut cast = cast.clone();
		cast.channel_id = cast.channel_id.or(known_channel);
		inner.casts.insert(cast.name.clone(), cast);
		Ok(())
	}

	async fn save_channel_id(&self, cast: &CastName, channel_id: ChannelId) -> anyhow::Result<()> {
		if let Some(c) = self.inner.lock().casts.get_mut(cast) {
			c.channel_id = Some(channel_id);
		}
		Ok(())
	}

	async fn touch_cast_online(&self, cast: &CastName, at_ms: i64) -> anyhow::Result<()> {
		self.inner.lock().last_online.insert(cast.clone(), at_ms);
		Ok(())
	}

	async fn close_orphan_sessions(&self, ended_at_ms: i64) -> anyhow::Result<u64> {
		let mut inner = self.inner.lock();
		let mut closed = 0;
		for session in inner.sessions.values_mut().filter(|s| s.ended_at_ms.is_none()) {
			session.ended_at_ms = Some(ended_at_ms);
			closed += 1;
		}
		Ok(closed)
	}

	async fn record_viewers(&self, snapshot: &ViewerSnapshot) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		for viewer in &snapshot.viewers {
			let key = (
				snapshot.account_id.clone(),
				snapshot.cast.clone(),
				viewer.user_name.clone(),
				snapshot.session_id,
			);
			inner
				.viewers
				.entry(key)
				.and_modify(|row| {
					row.last_seen_ms = snapshot.taken_at_ms;
					row.visit_count += 1;
					row.user_id = viewer.user_id.clone().or(row.user_id.take());
					row.league = viewer.league.clone().or(row.league.take());
					row.level = viewer.level.or(row.level);
					row.is_fan_club = viewer.is_fan_club;
				})
				.or_insert_with(|| ViewerRow {
					user_id: viewer.user_id.clone(),
					league: viewer.league.clone(),
					level: viewer.level,
					is_fan_club: viewer.is_fan_club,
					first_seen_ms: snapshot.taken_at_ms,
					last_seen_ms: snapshot.taken_at_ms,
					visit_count: 1,
				});
		}
		Ok(())
	}

	async fn upsert_payers(&self, account: &AccountId, payers: &[PayerEntry]) -> anyhow::Result<u64> {
		let mut inner = self.inner.lock();
		for payer in payers {
			inner
				.payers
				.insert((account.clone(), payer.user_name.clone()), payer.clone());
		}
		Ok(payers.len() as u64)
	}

	async fn insert_thumbnail(&self, thumbnail: &ThumbnailRecord) -> anyhow::Result<()> {
		self.inner.lock().thumbnails.push(thumbnail.clone());
		Ok(())
	}
}

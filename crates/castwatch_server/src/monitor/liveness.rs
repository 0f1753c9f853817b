#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use castwatch_domain::{CastName, ChannelId, LivenessStatus, SessionId};
use parking_lot::RwLock;

/// Poller's view of one cast.
///
/// `session_id` and `started_at_ms` are set exactly while `status` is live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LivenessRecord {
	pub status: LivenessStatus,
	pub session_id: Option<SessionId>,
	pub started_at_ms: Option<i64>,
	pub viewers: u32,
	pub peak_viewers: u32,
	pub channel_id: Option<ChannelId>,
}

impl LivenessRecord {
	pub fn is_live(&self) -> bool {
		self.status.is_live()
	}
}

/// Shared handle to the per-cast liveness map.
///
/// Anyone may read; only the poller writes.
#[derive(Debug, Clone, Default)]
pub struct LivenessBoard {
	inner: Arc<RwLock<HashMap<CastName, LivenessRecord>>>,
}

impl LivenessBoard {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, cast: &CastName) -> Option<LivenessRecord> {
		self.inner.read().get(cast).copied()
	}

	pub fn session_id(&self, cast: &CastName) -> Option<SessionId> {
		self.inner.read().get(cast).and_then(|r| r.session_id)
	}

	pub fn channel_id(&self, cast: &CastName) -> Option<ChannelId> {
		self.inner.read().get(cast).and_then(|r| r.channel_id)
	}

	/// Live casts sorted by name.
	pub fn live_casts(&self) -> Vec<(CastName, LivenessRecord)> {
		let mut live: Vec<_> = self
			.inner
			.read()
			.iter()
			.filter(|(_, r)| r.is_live())
			.map(|(n, r)| (n.clone(), *r))
			.collect();
		live.sort_by(|a, b| a.0.cmp(&b.0));
		live
	}

	pub fn live_count(&self) -> usize {
		self.inner.read().values().filter(|r| r.is_live()).count()
	}

	pub fn len(&self) -> usize {
		self.inner.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.read().is_empty()
	}

	pub(super) fn put(&self, cast: CastName, record: LivenessRecord) {
		self.inner.write().insert(cast, record);
	}

	pub(super) fn remove(&self, cast: &CastName) -> Option<LivenessRecord> {
		self.inner.write().remove(cast)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn name(s: &str) -> CastName {
		CastName::new(s).unwrap()
	}

	#[test]
	fn live_casts_are_sorted_and_filtered() {
		let board = LivenessBoard::new();
		let session = SessionId::new_v4();
		board.put(
			name("zeta"),
			LivenessRecord {
				status: LivenessStatus::Live,
				session_id: Some(session),
				..LivenessRecord::default()
			},
		);
		board.put(name("alpha"), LivenessRecord::default());
		board.put(
			name("beta"),
			LivenessRecord {
				status: LivenessStatus::Live,
				session_id: Some(SessionId::new_v4()),
				channel_id: Some(ChannelId::new(9)),
				..LivenessRecord::default()
			},
		);

		let live: Vec<_> = board.live_casts().into_iter().map(|(n, _)| n.into_string()).collect();
		assert_eq!(live, vec!["beta", "zeta"]);
		assert_eq!(board.live_count(), 2);
		assert_eq!(board.len(), 3);
		assert_eq!(board.session_id(&name("zeta")), Some(session));
		assert_eq!(board.channel_id(&name("beta")), Some(ChannelId::new(9)));
		assert!(board.session_id(&name("alpha")).is_none());

		assert!(board.remove(&name("zeta")).is_some());
		assert_eq!(board.live_count(), 1);
	}
}

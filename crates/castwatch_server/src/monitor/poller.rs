#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use castwatch_domain::{Cast, CastName, ChannelId, LivenessStatus, SessionId};
use castwatch_platform::{Credential, ProviderApi, StatusReport, Store, unix_ms_now};
use tracing::{debug, info, warn};

use crate::monitor::liveness::{LivenessBoard, LivenessRecord};
use crate::monitor::sessions::SessionTracker;

/// A liveness change seen in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
	Started {
		cast: CastName,
		session_id: SessionId,
		channel_id: Option<ChannelId>,
		/// First observation of the cast; no notification was sent.
		cold: bool,
	},
	Ended {
		cast: CastName,
		session_id: Option<SessionId>,
		peak_viewers: u32,
	},
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
	pub live: usize,
	pub idle: usize,
	pub errors: usize,
	pub transitions: Vec<Transition>,
}

/// Status lookups plus the per-cast transition state machine.
pub struct Poller {
	provider: Arc<dyn ProviderApi>,
	store: Arc<dyn Store>,
	board: LivenessBoard,
	sessions: Arc<SessionTracker>,
	politeness_delay: Duration,
}

impl Poller {
	pub fn new(
		provider: Arc<dyn ProviderApi>,
		store: Arc<dyn Store>,
		board: LivenessBoard,
		sessions: Arc<SessionTracker>,
		politeness_delay: Duration,
	) -> Self {
		Self {
			provider,
			store,
			board,
			sessions,
			politeness_delay,
		}
	}

	pub fn board(&self) -> &LivenessBoard {
		&self.board
	}

	/// Look up every cast once, in order, and apply the transitions.
	///
	/// A failed lookup degrades that cast to `error` and never affects the others.
	pub async fn poll_cycle(&self, casts: &[Cast], credential: &Credential) -> CycleSummary {
		let mut summary = CycleSummary::default();
		for (i, cast) in casts.iter().enumerate() {
			if i > 0 && !self.politeness_delay.is_zero() {
				tokio::time::sleep(self.politeness_delay).await;
			}

			let (status, report) = self.lookup(cast, credential).await;
			match status {
				LivenessStatus::Live => summary.live += 1,
				LivenessStatus::Idle => summary.idle += 1,
				LivenessStatus::Error => summary.errors += 1,
			}
			if let Some(t) = self.apply(cast, status, report.as_ref()).await {
				summary.transitions.push(t);
			}
		}

		metrics::counter!("castwatch_polls_total").increment(1);
		metrics::gauge!("castwatch_live_casts").set(self.board.live_count() as f64);
		summary
	}

	async fn lookup(&self, cast: &Cast, credential: &Credential) -> (LivenessStatus, Option<StatusReport>) {
		match self.provider.cam_status(&cast.name, credential).await {
			Ok(report) => {
				let status = report.liveness();
				metrics::counter!("castwatch_status_lookups_total", "outcome" => status.as_str()).increment(1);
				debug!(cast = %cast.name, status = %report.status, viewers = report.viewers, "status lookup");
				(status, Some(report))
			}
			Err(e) => {
				metrics::counter!("castwatch_status_lookups_total", "outcome" => e.label()).increment(1);
				warn!(cast = %cast.name, error = %e, "status lookup failed");
				(LivenessStatus::Error, None)
			}
		}
	}

	async fn apply(&self, cast: &Cast, status: LivenessStatus, report: Option<&StatusReport>) -> Option<Transition> {
		let now = unix_ms_now();
		let previous = self.board.get(&cast.name);
		let known_channel = previous.and_then(|p| p.channel_id).or(cast.channel_id);
		let reported_channel = report.and_then(|r| r.channel_id);
		let channel_id = reported_channel.or(known_channel);
		let viewers = report.map(|r| r.viewers).unwrap_or(0);

		if let Some(id) = reported_channel
			&& known_channel != Some(id)
		{
			if let Err(e) = self.store.save_channel_id(&cast.name, id).await {
				warn!(cast = %cast.name, error = %e, "failed to save channel id");
			} else {
				info!(cast = %cast.name, channel_id = %id, "channel id learned");
			}
		}
		if status.is_live()
			&& let Err(e) = self.store.touch_cast_online(&cast.name, now).await
		{
			warn!(cast = %cast.name, error = %e, "failed to touch cast online");
		}

		let was_live = previous.is_some_and(|p| p.is_live());
		match (was_live, status.is_live()) {
			(false, true) => {
				let cold = previous.is_none();
				let session_id = self.sessions.open(cast, now, !cold).await;
				self.board.put(
					cast.name.clone(),
					LivenessRecord {
						status,
						session_id: Some(session_id),
						started_at_ms: Some(now),
						viewers,
						peak_viewers: viewers,
						channel_id,
					},
				);
				info!(cast = %cast.name, session = %session_id, viewers, cold, "broadcast started");
				Some(Transition::Started {
					cast: cast.name.clone(),
					session_id,
					channel_id,
					cold,
				})
			}
			(true, true) => {
				let mut record = previous.unwrap_or_default();
				record.viewers = viewers;
				record.peak_viewers = record.peak_viewers.max(viewers);
				record.channel_id = channel_id;
				self.board.put(cast.name.clone(), record);
				None
			}
			(true, false) => {
				let prev = previous.unwrap_or_default();
				self.board.put(
					cast.name.clone(),
					LivenessRecord {
						status,
						channel_id,
						..LivenessRecord::default()
					},
				);
				info!(cast = %cast.name, %status, peak = prev.peak_viewers, "broadcast ended");
				Some(Transition::Ended {
					cast: cast.name.clone(),
					session_id: prev.session_id,
					peak_viewers: prev.peak_viewers,
				})
			}
			(false, false) => {
				self.board.put(
					cast.name.clone(),
					LivenessRecord {
						status,
						channel_id,
						..LivenessRecord::default()
					},
				);
				None
			}
		}
	}

	/// Drop a cast that left the directory. Returns its last record.
	pub fn forget(&self, cast: &CastName) -> Option<LivenessRecord> {
		self.board.remove(cast)
	}
}

#![forbid(unsafe_code)]

use std::time::Duration;

use castwatch_domain::{CastName, SessionId};
use castwatch_platform::unix_ms_now;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::monitor::clients::ClientRegistry;
use crate::monitor::liveness::LivenessBoard;
use crate::server::health::HealthState;

#[derive(Debug, Clone, Serialize)]
pub struct LiveCast {
	pub cast: CastName,
	pub session_id: Option<SessionId>,
	pub started_at_ms: Option<i64>,
	pub viewers: u32,
	pub peak_viewers: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
	pub cast: CastName,
	pub state: &'static str,
	pub messages: u64,
	pub tips: u64,
	pub buffered: usize,
	pub failures: u32,
}

/// What `/status` serves.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
	pub generated_at_ms: i64,
	pub monitored: usize,
	pub live: Vec<LiveCast>,
	pub clients: Vec<ClientStatus>,
	pub total_messages: u64,
	pub total_tips: u64,
}

pub fn snapshot(board: &LivenessBoard, clients: &ClientRegistry) -> StatusSnapshot {
	let live = board
		.live_casts()
		.into_iter()
		.map(|(cast, r)| LiveCast {
			cast,
			session_id: r.session_id,
			started_at_ms: r.started_at_ms,
			viewers: r.viewers,
			peak_viewers: r.peak_viewers,
		})
		.collect();
	let clients: Vec<ClientStatus> = clients
		.clients()
		.into_iter()
		.map(|(cast, c)| ClientStatus {
			cast,
			state: c.state().as_str(),
			messages: c.message_count(),
			tips: c.tip_total(),
			buffered: c.buffered(),
			failures: c.consecutive_failures(),
		})
		.collect();

	StatusSnapshot {
		generated_at_ms: unix_ms_now(),
		monitored: board.len(),
		live,
		total_messages: clients.iter().map(|c| c.messages).sum(),
		total_tips: clients.iter().map(|c| c.tips).sum(),
		clients,
	}
}

/// Log a summary and publish it to the health server on every tick.
pub async fn run_status_reporter(
	board: LivenessBoard,
	clients: ClientRegistry,
	health: HealthState,
	every: Duration,
	stop: CancellationToken,
) {
	let mut ticker = tokio::time::interval(every);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			_ = stop.cancelled() => break,
			_ = ticker.tick() => {}
		}

		let snap = snapshot(&board, &clients);
		let buffered: usize = snap.clients.iter().map(|c| c.buffered).sum();
		metrics::gauge!("castwatch_buffered_events").set(buffered as f64);
		info!(
			monitored = snap.monitored,
			live = snap.live.len(),
			clients = snap.clients.len(),
			messages = snap.total_messages,
			tips = snap.total_tips,
			buffered,
			"status report"
		);
		match serde_json::to_value(&snap) {
			Ok(v) => health.set_status(v),
			Err(e) => warn!(error = %e, "failed to encode status snapshot"),
		}
	}
}

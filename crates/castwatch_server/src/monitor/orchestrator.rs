#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use castwatch_domain::{Cast, CastName, CastSource, SessionId};
use castwatch_platform::centrifugo::{IngestionClient, IngestionConfig, IngestionTarget};
use castwatch_platform::notify::escape_html;
use castwatch_platform::{Credential, CredentialSource, Notifier, ProviderApi, RefreshSignal, Store, unix_ms_now};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::clients::ClientRegistry;
use crate::monitor::credentials::CredentialRefresher;
use crate::monitor::fetchers::{
	FetchContext, FetcherConfig, PayerFetcher, ThumbnailFetcher, ViewerFetcher, run_periodic,
};
use crate::monitor::liveness::LivenessBoard;
use crate::monitor::poller::{CycleSummary, Poller, Transition};
use crate::monitor::report::run_status_reporter;
use crate::monitor::sessions::{ClientCounters, SessionTracker};
use crate::server::health::HealthState;

/// Names listed per group in the startup message.
const STARTUP_LIST_LIMIT: usize = 5;

#[derive(Clone)]
pub struct OrchestratorConfig {
	pub poll_interval: Duration,
	pub politeness_delay: Duration,
	pub cast_reload_interval: Duration,
	pub status_report_interval: Duration,
	pub refresh_cooldown: Duration,

	/// Casts upserted into the directory before the first load.
	pub seed_casts: Vec<Cast>,

	pub ingestion: IngestionConfig,
	pub fetchers: FetcherConfig,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(60),
			politeness_delay: Duration::from_secs(2),
			cast_reload_interval: Duration::from_secs(300),
			status_report_interval: Duration::from_secs(60),
			refresh_cooldown: Duration::from_secs(5),
			seed_casts: Vec::new(),
			ingestion: IngestionConfig::default(),
			fetchers: FetcherConfig::default(),
		}
	}
}

struct Background {
	stop: CancellationToken,
	tasks: Vec<JoinHandle<()>>,
}

/// Owns the client registry and the credential; drives the poll loop.
pub struct Orchestrator {
	cfg: OrchestratorConfig,
	provider: Arc<dyn ProviderApi>,
	credential_source: Arc<dyn CredentialSource>,
	store: Arc<dyn Store>,
	notifier: Arc<dyn Notifier>,
	health: HealthState,

	board: LivenessBoard,
	sessions: Arc<SessionTracker>,
	poller: Poller,
	clients: ClientRegistry,
	refresh: Arc<RefreshSignal>,
	credential: Arc<watch::Sender<Credential>>,
	casts: Arc<RwLock<Vec<Cast>>>,

	last_reload: Option<Instant>,
	/// Live sessions already warned about for a missing channel id.
	skipped: HashSet<(CastName, SessionId)>,
	background: Option<Background>,
}

impl Orchestrator {
	pub fn new(
		cfg: OrchestratorConfig,
		provider: Arc<dyn ProviderApi>,
		credential_source: Arc<dyn CredentialSource>,
		store: Arc<dyn Store>,
		notifier: Arc<dyn Notifier>,
		health: HealthState,
	) -> Self {
		let board = LivenessBoard::new();
		let sessions = Arc::new(SessionTracker::new(store.clone(), notifier.clone()));
		let poller = Poller::new(
			provider.clone(),
			store.clone(),
			board.clone(),
			sessions.clone(),
			cfg.politeness_delay,
		);
		let (credential, _) = watch::channel(Credential::new(String::new()));

		Self {
			cfg,
			provider,
			credential_source,
			store,
			notifier,
			health,
			board,
			sessions,
			poller,
			clients: ClientRegistry::new(),
			refresh: Arc::new(RefreshSignal::new()),
			credential: Arc::new(credential),
			casts: Arc::new(RwLock::new(Vec::new())),
			last_reload: None,
			skipped: HashSet::new(),
			background: None,
		}
	}

	pub fn board(&self) -> &LivenessBoard {
		&self.board
	}

	pub fn clients(&self) -> &ClientRegistry {
		&self.clients
	}

	pub fn sessions(&self) -> &SessionTracker {
		&self.sessions
	}

	pub fn credential(&self) -> Credential {
		self.credential.borrow().clone()
	}

	pub fn casts(&self) -> Vec<Cast> {
		self.casts.read().clone()
	}

	/// Startup, then poll until `shutdown` fires, then tear down.
	pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
		self.startup(&shutdown).await;

		let mut ticker = tokio::time::interval(self.cfg.poll_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => break,
				_ = ticker.tick() => {}
			}

			// lookups are abandoned on shutdown; teardown of ended sessions is not
			let summary = tokio::select! {
				_ = shutdown.cancelled() => break,
				s = self.poll() => s,
			};
			self.settle(&summary).await;
		}

		self.shutdown().await;
		Ok(())
	}

	/// Credential, orphan cleanup, cast directory, background tasks.
	pub async fn startup(&mut self, parent: &CancellationToken) {
		match self.credential_source.fetch_credential().await {
			Ok(c) if c.has_token() || c.cookie_header().is_some() => {
				self.credential.send_replace(c);
				info!("initial credential acquired");
			}
			Ok(_) => warn!("no initial credential; connecting without a token"),
			Err(e) => warn!(error = %e, "initial credential fetch failed"),
		}

		match self.store.close_orphan_sessions(unix_ms_now()).await {
			Ok(0) => {}
			Ok(n) => info!(closed = n, "closed sessions left open by a previous run"),
			Err(e) => warn!(error = %e, "failed to close orphan sessions"),
		}

		for cast in &self.cfg.seed_casts {
			if let Err(e) = self.store.upsert_cast(cast).await {
				warn!(cast = %cast.name, error = %e, "failed to seed cast");
			}
		}
		self.reload_casts().await;

		self.notifier.notify(&self.startup_message()).await;
		self.spawn_background(parent);
		self.health.mark_ready();
		info!(casts = self.casts.read().len(), "orchestrator started");
	}

	fn startup_message(&self) -> String {
		let casts = self.casts.read();
		let list = |source: CastSource| {
			let names: Vec<_> = casts.iter().filter(|c| c.source == source).map(|c| c.display()).collect();
			let mut shown = names
				.iter()
				.take(STARTUP_LIST_LIMIT)
				.map(|n| escape_html(n))
				.collect::<Vec<_>>()
				.join(", ");
			if names.len() > STARTUP_LIST_LIMIT {
				shown.push_str(", ...");
			}
			if shown.is_empty() {
				shown.push('-');
			}
			(names.len(), shown)
		};
		let (owned_n, owned) = list(CastSource::Owned);
		let (observed_n, observed) = list(CastSource::Observed);
		format!("🚀 <b>castwatch started</b>\nowned ({owned_n}): {owned}\nobserved ({observed_n}): {observed}")
	}

	fn spawn_background(&mut self, parent: &CancellationToken) {
		let stop = parent.child_token();
		let mut tasks = Vec::new();

		let refresher = CredentialRefresher::new(
			self.credential_source.clone(),
			self.refresh.clone(),
			self.credential.clone(),
			self.clients.clone(),
			self.cfg.refresh_cooldown,
		);
		tasks.push(tokio::spawn(refresher.run(stop.clone())));

		let ctx = FetchContext {
			provider: self.provider.clone(),
			store: self.store.clone(),
			board: self.board.clone(),
			casts: self.casts.clone(),
			credential: self.credential.subscribe(),
		};
		let fcfg = &self.cfg.fetchers;
		tasks.push(tokio::spawn(run_periodic(ViewerFetcher::new(ctx.clone(), fcfg), stop.clone())));
		tasks.push(tokio::spawn(run_periodic(PayerFetcher::new(ctx.clone(), fcfg), stop.clone())));
		tasks.push(tokio::spawn(run_periodic(ThumbnailFetcher::new(ctx, fcfg), stop.clone())));

		tasks.push(tokio::spawn(run_status_reporter(
			self.board.clone(),
			self.clients.clone(),
			self.health.clone(),
			self.cfg.status_report_interval,
			stop.clone(),
		)));

		self.background = Some(Background { stop, tasks });
	}

	fn reload_due(&self) -> bool {
		self.last_reload
			.is_none_or(|at| at.elapsed() >= self.cfg.cast_reload_interval)
	}

	/// Re-read the directory; live casts that disappeared are torn down.
	pub async fn reload_casts(&mut self) {
		self.last_reload = Some(Instant::now());
		let fresh = match self.store.load_casts().await {
			Ok(casts) => casts,
			Err(e) => {
				warn!(error = %e, "failed to load casts; keeping the current list");
				return;
			}
		};

		let previous = std::mem::replace(&mut *self.casts.write(), fresh.clone());
		let kept: HashSet<&CastName> = fresh.iter().map(|c| &c.name).collect();
		for gone in previous.iter().filter(|c| !kept.contains(&c.name)) {
			if let Some(record) = self.poller.forget(&gone.name)
				&& record.is_live()
			{
				info!(cast = %gone.name, "live cast left the directory");
				self.end_session(gone, record.peak_viewers).await;
			}
		}

		let added = fresh
			.iter()
			.filter(|c| !previous.iter().any(|p| p.name == c.name))
			.count();
		if added > 0 || previous.len() != fresh.len() {
			info!(casts = fresh.len(), added, "cast directory reloaded");
		}
	}

	/// One poll cycle plus the resulting client changes.
	pub async fn run_cycle(&mut self) -> CycleSummary {
		let summary = self.poll().await;
		self.settle(&summary).await;
		summary
	}

	async fn poll(&mut self) -> CycleSummary {
		if self.reload_due() {
			self.reload_casts().await;
		}
		let casts = self.casts();
		let credential = self.credential();
		self.poller.poll_cycle(&casts, &credential).await
	}

	async fn settle(&mut self, summary: &CycleSummary) {
		let casts = self.casts();
		for t in &summary.transitions {
			if let Transition::Ended { cast, peak_viewers, .. } = t
				&& let Some(cast) = casts.iter().find(|c| &c.name == cast)
			{
				self.end_session(cast, *peak_viewers).await;
			}
		}
		self.reconcile(&casts);

		info!(
			live = summary.live,
			idle = summary.idle,
			errors = summary.errors,
			clients = self.clients.len(),
			"poll cycle complete"
		);
	}

	/// Tear down the client (final flush) before finalizing with its counters.
	async fn end_session(&mut self, cast: &Cast, peak_viewers: u32) {
		let counters = match self.clients.remove(&cast.name) {
			Some(client) => {
				client.disconnect().await;
				Some(ClientCounters::of(&client))
			}
			None => None,
		};
		self.skipped.retain(|(name, _)| name != &cast.name);
		self.sessions
			.finalize(cast, unix_ms_now(), counters, peak_viewers)
			.await;
	}

	/// Spawn a client for every live cast that lacks one.
	fn reconcile(&mut self, casts: &[Cast]) {
		let live = self.board.live_casts();
		self.skipped
			.retain(|(name, session)| live.iter().any(|(n, r)| n == name && r.session_id == Some(*session)));

		for (name, record) in live {
			if self.clients.contains(&name) {
				continue;
			}
			let Some(cast) = casts.iter().find(|c| c.name == name) else {
				continue;
			};
			let Some(session_id) = record.session_id else {
				continue;
			};
			let Some(channel_id) = record.channel_id.or(cast.channel_id) else {
				if self.skipped.insert((name.clone(), session_id)) {
					warn!(cast = %name, "channel id unknown; not starting ingestion");
				}
				continue;
			};

			let client = Arc::new(IngestionClient::new(
				self.cfg.ingestion.clone(),
				IngestionTarget {
					cast: name.clone(),
					account_id: cast.account_id.clone(),
					channel_id,
					session_id: Some(session_id),
				},
				self.credential(),
				self.store.clone(),
				self.notifier.clone(),
				self.refresh.clone(),
			));
			self.clients.register(name.clone(), client.clone(), &self.credential);
			client.connect();
			debug!(cast = %name, channel_id = %channel_id, session = %session_id, "ingestion client spawned");
		}
	}

	/// Stop background work, drain every client, close what is still open.
	pub async fn shutdown(&mut self) {
		self.health.mark_not_ready();
		if let Some(bg) = self.background.take() {
			bg.stop.cancel();
			for task in bg.tasks {
				if let Err(e) = task.await {
					warn!(error = %e, "background task join failed");
				}
			}
		}

		let drained = self.clients.drain();
		futures::future::join_all(drained.iter().map(|(_, c)| c.disconnect())).await;
		let counters: HashMap<CastName, ClientCounters> = drained
			.iter()
			.map(|(name, c)| (name.clone(), ClientCounters::of(c)))
			.collect();

		let casts = self.casts();
		let now = unix_ms_now();
		let mut closed = 0;
		for name in self.sessions.open_casts() {
			let cast = casts
				.iter()
				.find(|c| c.name == name)
				.cloned()
				.or_else(|| self.sessions.account_of(&name).map(|acc| Cast::new(name.clone(), acc)));
			let Some(cast) = cast else {
				continue;
			};
			let peak = self.board.get(&name).map(|r| r.peak_viewers).unwrap_or(0);
			if self
				.sessions
				.finalize(&cast, now, counters.get(&name).copied(), peak)
				.await
				.is_some()
			{
				closed += 1;
			}
		}

		self.notifier
			.notify(&format!("🛑 <b>castwatch stopped</b>\nclosed sessions: {closed}"))
			.await;
		info!(clients = drained.len(), closed, "orchestrator stopped");
	}
}

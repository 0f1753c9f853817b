#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use castwatch_domain::{AccountId, Cast, CastName, CastSource, SessionId};
use castwatch_platform::{
	Credential, PayerEntry, ProviderApi, ProviderError, Store, ThumbnailRecord, ViewerSnapshot, unix_ms_now,
};
use castwatch_util::cadence::CooldownGate;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::liveness::LivenessBoard;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
	pub viewer_every: Duration,
	pub viewer_scan: Duration,
	pub payer_every: Duration,
	pub payer_scan: Duration,
	pub thumbnail_every: Duration,
	pub thumbnail_scan: Duration,

	/// Pause between consecutive provider calls.
	pub politeness_delay: Duration,

	pub payer_page_size: u32,
	pub payer_max_pages: u32,

	/// Wait before retrying a rate-limited page.
	pub rate_limit_wait: Duration,

	/// Account id -> provider user id used for payer listings.
	pub payer_accounts: BTreeMap<AccountId, String>,
}

impl Default for FetcherConfig {
	fn default() -> Self {
		Self {
			viewer_every: Duration::from_secs(180),
			viewer_scan: Duration::from_secs(30),
			payer_every: Duration::from_secs(3_600),
			payer_scan: Duration::from_secs(60),
			thumbnail_every: Duration::from_secs(300),
			thumbnail_scan: Duration::from_secs(60),
			politeness_delay: Duration::from_secs(2),
			payer_page_size: 100,
			payer_max_pages: 50,
			rate_limit_wait: Duration::from_secs(10),
			payer_accounts: BTreeMap::new(),
		}
	}
}

/// Handles every fetcher reads from.
#[derive(Clone)]
pub struct FetchContext {
	pub provider: Arc<dyn ProviderApi>,
	pub store: Arc<dyn Store>,
	pub board: LivenessBoard,
	pub casts: Arc<RwLock<Vec<Cast>>>,
	pub credential: watch::Receiver<Credential>,
}

impl FetchContext {
	fn credential(&self) -> Credential {
		self.credential.borrow().clone()
	}

	fn cast(&self, name: &CastName) -> Option<Cast> {
		self.casts.read().iter().find(|c| &c.name == name).cloned()
	}

	/// Live casts in the directory with their session.
	fn live(&self) -> Vec<(Cast, SessionId)> {
		self.board
			.live_casts()
			.into_iter()
			.filter_map(|(name, record)| Some((self.cast(&name)?, record.session_id?)))
			.collect()
	}
}

async fn pause(delay: Duration) {
	if !delay.is_zero() {
		tokio::time::sleep(delay).await;
	}
}

/// A loop body that runs on a fixed scan interval.
#[async_trait::async_trait]
pub trait PeriodicTask: Send + 'static {
	fn name(&self) -> &'static str;

	fn scan_interval(&self) -> Duration;

	async fn tick(&mut self, now: Instant);
}

/// Drive `task` until `stop` fires. An in-flight tick is abandoned on stop.
pub async fn run_periodic<T: PeriodicTask>(mut task: T, stop: CancellationToken) {
	let name = task.name();
	let mut ticker = tokio::time::interval(task.scan_interval());
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
	info!(fetcher = name, every = ?task.scan_interval(), "fetcher started");
	loop {
		tokio::select! {
			_ = stop.cancelled() => break,
			_ = async {
				ticker.tick().await;
				task.tick(Instant::now()).await;
			} => {}
		}
	}
	info!(fetcher = name, "fetcher stopped");
}

/// Viewer list per live session, at most once per `viewer_every`.
pub struct ViewerFetcher {
	ctx: FetchContext,
	scan: Duration,
	politeness_delay: Duration,
	gate: CooldownGate<(CastName, SessionId)>,
}

impl ViewerFetcher {
	pub fn new(ctx: FetchContext, cfg: &FetcherConfig) -> Self {
		Self {
			ctx,
			scan: cfg.viewer_scan,
			politeness_delay: cfg.politeness_delay,
			gate: CooldownGate::new(cfg.viewer_every),
		}
	}
}

#[async_trait::async_trait]
impl PeriodicTask for ViewerFetcher {
	fn name(&self) -> &'static str {
		"viewers"
	}

	fn scan_interval(&self) -> Duration {
		self.scan
	}

	async fn tick(&mut self, now: Instant) {
		let live = self.ctx.live();
		self.gate
			.retain(|(name, session)| live.iter().any(|(c, s)| &c.name == name && s == session));

		let credential = self.ctx.credential();
		let mut fetched = 0;
		for (cast, session) in live {
			if !self.gate.try_acquire(&(cast.name.clone(), session), now) {
				continue;
			}
			if fetched > 0 {
				pause(self.politeness_delay).await;
			}
			fetched += 1;

			match self.ctx.provider.viewers(&cast.name, &credential).await {
				Ok(viewers) => {
					let count = viewers.len();
					let snapshot = ViewerSnapshot {
						cast: cast.name.clone(),
						account_id: cast.account_id.clone(),
						session_id: Some(session),
						taken_at_ms: unix_ms_now(),
						viewers,
					};
					match self.ctx.store.record_viewers(&snapshot).await {
						Ok(()) => {
							metrics::counter!("castwatch_fetches_total", "fetcher" => "viewers", "outcome" => "ok")
								.increment(1);
							debug!(cast = %cast.name, count, "viewer snapshot stored");
						}
						Err(e) => {
							metrics::counter!("castwatch_fetches_total", "fetcher" => "viewers", "outcome" => "store")
								.increment(1);
							warn!(cast = %cast.name, error = %e, "failed to store viewer snapshot");
						}
					}
				}
				Err(e) => {
					metrics::counter!("castwatch_fetches_total", "fetcher" => "viewers", "outcome" => e.label())
						.increment(1);
					warn!(cast = %cast.name, error = %e, "viewer lookup failed");
				}
			}
		}
	}
}

/// Thumbnail reference per live session, at most once per `thumbnail_every`.
pub struct ThumbnailFetcher {
	ctx: FetchContext,
	scan: Duration,
	gate: CooldownGate<(CastName, SessionId)>,
}

impl ThumbnailFetcher {
	pub fn new(ctx: FetchContext, cfg: &FetcherConfig) -> Self {
		Self {
			ctx,
			scan: cfg.thumbnail_scan,
			gate: CooldownGate::new(cfg.thumbnail_every),
		}
	}
}

#[async_trait::async_trait]
impl PeriodicTask for ThumbnailFetcher {
	fn name(&self) -> &'static str {
		"thumbnails"
	}

	fn scan_interval(&self) -> Duration {
		self.scan
	}

	async fn tick(&mut self, now: Instant) {
		let live = self.ctx.live();
		self.gate
			.retain(|(name, session)| live.iter().any(|(c, s)| &c.name == name && s == session));

		for (cast, session) in live {
			let Some(channel_id) = self.ctx.board.channel_id(&cast.name).or(cast.channel_id) else {
				debug!(cast = %cast.name, "no channel id yet; skipping thumbnail");
				continue;
			};
			if !self.gate.try_acquire(&(cast.name.clone(), session), now) {
				continue;
			}

			let record = ThumbnailRecord {
				cast: cast.name.clone(),
				account_id: cast.account_id.clone(),
				session_id: Some(session),
				url: self.ctx.provider.thumbnail_url(channel_id),
				captured_at_ms: unix_ms_now(),
			};
			if let Err(e) = self.ctx.store.insert_thumbnail(&record).await {
				metrics::counter!("castwatch_fetches_total", "fetcher" => "thumbnails", "outcome" => "store")
					.increment(1);
				warn!(cast = %cast.name, error = %e, "failed to store thumbnail");
			} else {
				metrics::counter!("castwatch_fetches_total", "fetcher" => "thumbnails", "outcome" => "ok").increment(1);
			}
		}
	}
}

/// Paged payer list per owned account, at most once per `payer_every`.
pub struct PayerFetcher {
	ctx: FetchContext,
	cfg: FetcherConfig,
	gate: CooldownGate<AccountId>,
}

impl PayerFetcher {
	pub fn new(ctx: FetchContext, cfg: &FetcherConfig) -> Self {
		Self {
			ctx,
			gate: CooldownGate::new(cfg.payer_every),
			cfg: cfg.clone(),
		}
	}

	/// Accounts that own at least one cast and have a provider user id.
	fn accounts(&self) -> Vec<(AccountId, String)> {
		let casts = self.ctx.casts.read();
		self.cfg
			.payer_accounts
			.iter()
			.filter(|(account, _)| {
				casts
					.iter()
					.any(|c| c.source == CastSource::Owned && &c.account_id == *account)
			})
			.map(|(a, uid)| (a.clone(), uid.clone()))
			.collect()
	}

	/// Walk the pages until a short page, an auth failure or the page cap.
	///
	/// A rate-limited page is retried at the same offset and still counts toward the cap.
	pub async fn fetch_all(&self, provider_user_id: &str, credential: &Credential) -> Vec<PayerEntry> {
		let limit = self.cfg.payer_page_size.max(1);
		let mut payers = Vec::new();
		let mut offset = 0;
		for attempt in 0..self.cfg.payer_max_pages {
			if attempt > 0 {
				pause(self.cfg.politeness_delay).await;
			}
			match self
				.ctx
				.provider
				.payers_page(provider_user_id, offset, limit, credential)
				.await
			{
				Ok(page) => {
					let short = page.len() < limit as usize;
					payers.extend(page);
					if short {
						break;
					}
					offset += limit;
				}
				Err(ProviderError::RateLimited) => {
					warn!(offset, wait = ?self.cfg.rate_limit_wait, "payer listing rate limited");
					pause(self.cfg.rate_limit_wait).await;
				}
				Err(e) => {
					warn!(offset, error = %e, "payer listing stopped");
					break;
				}
			}
		}
		payers
	}
}

#[async_trait::async_trait]
impl PeriodicTask for PayerFetcher {
	fn name(&self) -> &'static str {
		"payers"
	}

	fn scan_interval(&self) -> Duration {
		self.cfg.payer_scan
	}

	async fn tick(&mut self, now: Instant) {
		let accounts = self.accounts();
		self.gate.retain(|a| accounts.iter().any(|(acc, _)| acc == a));

		let credential = self.ctx.credential();
		for (account, uid) in accounts {
			if !self.gate.try_acquire(&account, now) {
				continue;
			}
			let payers = self.fetch_all(&uid, &credential).await;
			if payers.is_empty() {
				debug!(account = %account, "no payers returned");
				continue;
			}
			match self.ctx.store.upsert_payers(&account, &payers).await {
				Ok(n) => {
					metrics::counter!("castwatch_fetches_total", "fetcher" => "payers", "outcome" => "ok").increment(1);
					info!(account = %account, payers = n, "payer snapshot stored");
				}
				Err(e) => {
					metrics::counter!("castwatch_fetches_total", "fetcher" => "payers", "outcome" => "store").increment(1);
					warn!(account = %account, error = %e, "failed to store payers");
				}
			}
		}
	}
}

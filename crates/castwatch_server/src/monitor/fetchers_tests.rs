#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use castwatch_domain::{CastSource, ChannelId, LivenessStatus, SessionId};
use castwatch_platform::{Credential, ProviderError, ViewerEntry};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::monitor::fetchers::{
	FetchContext, FetcherConfig, PayerFetcher, PeriodicTask, ThumbnailFetcher, ViewerFetcher, run_periodic,
};
use crate::monitor::liveness::{LivenessBoard, LivenessRecord};
use crate::monitor::testkit::{ScriptedProvider, account, cast, name, payer};
use crate::store::MemoryStore;

struct Rig {
	provider: Arc<ScriptedProvider>,
	store: Arc<MemoryStore>,
	board: LivenessBoard,
	ctx: FetchContext,
	_credential: watch::Sender<Credential>,
}

fn rig(casts: Vec<castwatch_domain::Cast>) -> Rig {
	let provider = ScriptedProvider::new();
	let store = Arc::new(MemoryStore::new());
	let board = LivenessBoard::new();
	let (tx, rx) = watch::channel(Credential::new("jwt"));
	let ctx = FetchContext {
		provider: provider.clone(),
		store: store.clone(),
		board: board.clone(),
		casts: Arc::new(RwLock::new(casts)),
		credential: rx,
	};
	Rig {
		provider,
		store,
		board,
		ctx,
		_credential: tx,
	}
}

fn go_live(board: &LivenessBoard, cast: &str, channel: Option<u64>) -> SessionId {
	let session = SessionId::new_v4();
	board.put(
		name(cast),
		LivenessRecord {
			status: LivenessStatus::Live,
			session_id: Some(session),
			started_at_ms: Some(0),
			channel_id: channel.map(ChannelId::new),
			..LivenessRecord::default()
		},
	);
	session
}

fn cfg() -> FetcherConfig {
	FetcherConfig {
		politeness_delay: Duration::ZERO,
		rate_limit_wait: Duration::ZERO,
		..FetcherConfig::default()
	}
}

#[tokio::test]
async fn viewer_fetch_respects_cadence_and_new_sessions() {
	let r = rig(vec![cast("risa"), cast("quiet")]);
	r.provider.set_viewers(vec![ViewerEntry {
		user_name: "fan".to_string(),
		user_id: Some("1".to_string()),
		league: None,
		level: None,
		is_fan_club: true,
	}]);
	let first = go_live(&r.board, "risa", Some(1));
	let mut fetcher = ViewerFetcher::new(r.ctx.clone(), &cfg());

	let t0 = Instant::now();
	fetcher.tick(t0).await;
	fetcher.tick(t0 + Duration::from_secs(30)).await;
	assert_eq!(r.provider.viewer_calls.lock().len(), 1);

	fetcher.tick(t0 + Duration::from_secs(180)).await;
	assert_eq!(r.provider.viewer_calls.lock().len(), 2);

	let rows = r.store.viewer_rows();
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].0.3, Some(first));
	assert_eq!(rows[0].1.visit_count, 2);

	// a new broadcast is fetched right away
	let second = go_live(&r.board, "risa", Some(1));
	fetcher.tick(t0 + Duration::from_secs(190)).await;
	assert_eq!(r.provider.viewer_calls.lock().len(), 3);
	assert!(r.store.viewer_rows().iter().any(|(k, _)| k.3 == Some(second)));
}

#[tokio::test]
async fn thumbnails_need_a_channel_id() {
	let r = rig(vec![cast("risa"), cast("nochan")]);
	let session = go_live(&r.board, "risa", Some(178));
	go_live(&r.board, "nochan", None);
	let mut fetcher = ThumbnailFetcher::new(r.ctx.clone(), &cfg());

	let t0 = Instant::now();
	fetcher.tick(t0).await;
	fetcher.tick(t0 + Duration::from_secs(60)).await;

	let thumbs = r.store.thumbnails();
	assert_eq!(thumbs.len(), 1);
	assert_eq!(thumbs[0].url, "https://thumbs.test/178_webp");
	assert_eq!(thumbs[0].session_id, Some(session));
}

#[tokio::test]
async fn payer_paging_retries_rate_limits_and_stops_on_short_page() {
	let mut c = cfg();
	c.payer_page_size = 2;
	let r = rig(vec![cast("risa")]);
	r.provider.push_payer_pages([
		Ok(vec![payer("a", 10), payer("b", 9)]),
		Err(ProviderError::RateLimited),
		Ok(vec![payer("c", 8), payer("d", 7)]),
		Ok(vec![payer("e", 1)]),
	]);
	let fetcher = PayerFetcher::new(r.ctx.clone(), &c);

	let payers = fetcher.fetch_all("555", &Credential::new("jwt")).await;
	assert_eq!(payers.len(), 5);
	assert_eq!(*r.provider.payer_offsets.lock(), vec![0, 2, 2, 4]);
}

#[tokio::test]
async fn payer_paging_stops_on_auth_failure_and_page_cap() {
	let mut c = cfg();
	c.payer_page_size = 1;
	c.payer_max_pages = 3;
	let r = rig(vec![cast("risa")]);
	r.provider.push_payer_pages([Ok(vec![payer("a", 1)]), Err(ProviderError::Unauthorized)]);
	let fetcher = PayerFetcher::new(r.ctx.clone(), &c);
	assert_eq!(fetcher.fetch_all("555", &Credential::new("jwt")).await.len(), 1);

	r.provider.payer_offsets.lock().clear();
	r.provider.push_payer_pages((0..10).map(|i| Ok(vec![payer(&format!("u{i}"), 1)])));
	assert_eq!(fetcher.fetch_all("555", &Credential::new("jwt")).await.len(), 3);
	assert_eq!(*r.provider.payer_offsets.lock(), vec![0, 1, 2]);
}

#[tokio::test]
async fn payers_only_for_owned_accounts_with_a_user_id() {
	let mut c = cfg();
	c.payer_accounts = BTreeMap::from([
		(account("acc-1"), "555".to_string()),
		(account("acc-spy"), "777".to_string()),
	]);
	let mut rival = cast("rival").with_source(CastSource::Observed);
	rival.account_id = account("acc-spy");
	let r = rig(vec![cast("risa"), rival]);
	r.provider.push_payer_pages([Ok(vec![payer("whale", 5_000)])]);

	let mut fetcher = PayerFetcher::new(r.ctx.clone(), &c);
	let t0 = Instant::now();
	fetcher.tick(t0).await;
	fetcher.tick(t0 + Duration::from_secs(60)).await;

	assert_eq!(r.provider.payer_offsets.lock().len(), 1);
	assert_eq!(r.store.payers(&account("acc-1")).len(), 1);
	assert!(r.store.payers(&account("acc-spy")).is_empty());
}

#[tokio::test]
async fn periodic_runner_stops_on_cancel() {
	let r = rig(vec![cast("risa")]);
	go_live(&r.board, "risa", Some(1));
	let fetcher = ViewerFetcher::new(
		r.ctx.clone(),
		&FetcherConfig {
			viewer_scan: Duration::from_millis(10),
			..cfg()
		},
	);
	let stop = CancellationToken::new();
	let task = tokio::spawn(run_periodic(fetcher, stop.clone()));

	tokio::time::timeout(Duration::from_secs(2), async {
		while r.provider.viewer_calls.lock().is_empty() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("first scan runs immediately");

	stop.cancel();
	tokio::time::timeout(Duration::from_secs(1), task)
		.await
		.expect("runner exits")
		.expect("join");
}

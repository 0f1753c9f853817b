#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use castwatch_domain::{AccountId, Cast, CastName, ChannelId};
use castwatch_platform::centrifugo::IngestionConfig;
use castwatch_platform::{
	Credential, CredentialSource, Notifier, PayerEntry, ProviderApi, ProviderError, StatusReport, ViewerEntry,
};
use castwatch_util::backoff::BackoffTable;
use parking_lot::Mutex;

use crate::monitor::fetchers::FetcherConfig;
use crate::monitor::orchestrator::OrchestratorConfig;

pub type Lookup = Result<StatusReport, ProviderError>;

/// Provider whose answers are queued per cast; the last answer repeats.
#[derive(Default)]
pub struct ScriptedProvider {
	statuses: Mutex<HashMap<CastName, VecDeque<Lookup>>>,
	viewers: Mutex<Vec<ViewerEntry>>,
	payer_pages: Mutex<VecDeque<Result<Vec<PayerEntry>, ProviderError>>>,
	pub status_calls: Mutex<Vec<CastName>>,
	pub viewer_calls: Mutex<Vec<CastName>>,
	pub payer_offsets: Mutex<Vec<u32>>,
}

impl ScriptedProvider {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn script(&self, cast: &str, answers: impl IntoIterator<Item = Lookup>) {
		self.statuses
			.lock()
			.entry(name(cast))
			.or_default()
			.extend(answers);
	}

	pub fn set_viewers(&self, viewers: Vec<ViewerEntry>) {
		*self.viewers.lock() = viewers;
	}

	pub fn push_payer_pages(&self, pages: impl IntoIterator<Item = Result<Vec<PayerEntry>, ProviderError>>) {
		self.payer_pages.lock().extend(pages);
	}
}

#[async_trait::async_trait]
impl ProviderApi for ScriptedProvider {
	async fn cam_status(&self, cast: &CastName, _credential: &Credential) -> Result<StatusReport, ProviderError> {
		self.status_calls.lock().push(cast.clone());
		let mut statuses = self.statuses.lock();
		let Some(queue) = statuses.get_mut(cast) else {
			return Err(ProviderError::NotFound);
		};
		if queue.len() > 1 {
			queue.pop_front().unwrap_or(Err(ProviderError::NotFound))
		} else {
			queue.front().cloned().unwrap_or(Err(ProviderError::NotFound))
		}
	}

	async fn viewers(&self, cast: &CastName, _credential: &Credential) -> Result<Vec<ViewerEntry>, ProviderError> {
		self.viewer_calls.lock().push(cast.clone());
		Ok(self.viewers.lock().clone())
	}

	async fn payers_page(
		&self,
		_provider_user_id: &str,
		offset: u32,
		_limit: u32,
		_credential: &Credential,
	) -> Result<Vec<PayerEntry>, ProviderError> {
		self.payer_offsets.lock().push(offset);
		self.payer_pages.lock().pop_front().unwrap_or(Ok(Vec::new()))
	}

	fn thumbnail_url(&self, channel_id: ChannelId) -> String {
		format!("https://thumbs.test/{channel_id}_webp")
	}
}

pub struct StaticCredentials(pub Credential);

#[async_trait::async_trait]
impl CredentialSource for StaticCredentials {
	async fn fetch_credential(&self) -> anyhow::Result<Credential> {
		Ok(self.0.clone())
	}
}

#[derive(Default)]
pub struct CollectingNotifier {
	pub messages: Mutex<Vec<String>>,
}

impl CollectingNotifier {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn count(&self, needle: &str) -> usize {
		self.messages.lock().iter().filter(|m| m.contains(needle)).count()
	}
}

#[async_trait::async_trait]
impl Notifier for CollectingNotifier {
	async fn notify(&self, message: &str) {
		self.messages.lock().push(message.to_string());
	}
}

pub fn name(s: &str) -> CastName {
	CastName::new(s).unwrap()
}

pub fn account(s: &str) -> AccountId {
	AccountId::new(s).unwrap()
}

pub fn cast(s: &str) -> Cast {
	Cast::new(name(s), account("acc-1"))
}

pub fn live(viewers: u32, channel: Option<u64>) -> Lookup {
	Ok(StatusReport {
		status: "public".to_string(),
		channel_id: channel.map(ChannelId::new),
		viewers,
	})
}

pub fn idle() -> Lookup {
	Ok(StatusReport {
		status: "off".to_string(),
		channel_id: None,
		viewers: 0,
	})
}

pub fn payer(user: &str, tokens: u64) -> PayerEntry {
	PayerEntry {
		user_name: user.to_string(),
		user_id: None,
		total_tokens: tokens,
		last_paid: None,
	}
}

/// A local address nothing listens on.
pub fn refused_ws_url() -> String {
	let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = listener.local_addr().unwrap();
	drop(listener);
	format!("ws://{addr}/connection/websocket")
}

pub fn test_config(seed_casts: Vec<Cast>) -> OrchestratorConfig {
	OrchestratorConfig {
		poll_interval: Duration::from_millis(20),
		politeness_delay: Duration::ZERO,
		cast_reload_interval: Duration::from_secs(3_600),
		status_report_interval: Duration::from_secs(3_600),
		refresh_cooldown: Duration::from_millis(10),
		seed_casts,
		ingestion: IngestionConfig {
			ws_url: refused_ws_url(),
			connect_timeout: Duration::from_millis(200),
			keepalive_interval: Duration::from_secs(60),
			flush_interval: Duration::from_secs(60),
			backoff: BackoffTable::new(vec![Duration::from_millis(50)]).unwrap(),
			// keep connection failures out of the notifier
			alert_threshold: u32::MAX,
			..IngestionConfig::default()
		},
		fetchers: FetcherConfig {
			politeness_delay: Duration::ZERO,
			rate_limit_wait: Duration::ZERO,
			..FetcherConfig::default()
		},
	}
}

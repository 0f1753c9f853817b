#![forbid(unsafe_code)]


use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use castwatch_domain::{AccountId, Cast, CastName, CastSource, ChannelId};
use castwatch_platform::centrifugo::{DEFAULT_AUTH_ERROR_CODES, DEFAULT_CHANNELS, DEFAULT_WS_URL, IngestionConfig};
use castwatch_platform::stripchat::{DEFAULT_BASE_URL, DEFAULT_THUMBNAIL_BASE, DEFAULT_USER_AGENT, StripchatConfig};
use castwatch_platform::{Credential, SecretString};
use castwatch_util::backoff::BackoffTable;
use serde::Deserialize;
use tracing::{info, warn};

use crate::monitor::fetchers::FetcherConfig;
use crate::monitor::orchestrator::OrchestratorConfig;

/// Default config path: `~/.castwatch/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".castwatch").join("config.toml"))
}

/// Load the collector config from TOML and `CASTWATCH_*` env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<CollectorConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = CollectorConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
	pub server: ServerSettings,
	pub provider: ProviderSettings,
	pub poller: PollerSettings,
	pub ingest: IngestSettings,
	pub fetchers: FetcherSettings,
	pub credentials: CredentialSettings,
	pub notify: NotifySettings,
	pub persistence: PersistenceSettings,

	/// Casts seeded into the store's directory at startup.
	pub casts: Vec<Cast>,

	/// Account id -> provider user id, needed for payer snapshots.
	pub payer_accounts: BTreeMap<AccountId, String>,

	/// Poll and ingest, but keep everything in memory.
	pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
	pub base_url: String,
	pub thumbnail_base: String,
	pub user_agent: String,
	pub accept_language: String,
	pub request_timeout: Duration,
	pub credential_page: String,
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
	pub interval: Duration,
	/// Pause between two status lookups in one cycle.
	pub politeness_delay: Duration,
	pub cast_reload_interval: Duration,
	pub status_report_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
	pub ws_url: String,
	pub origin: String,
	pub keepalive: Duration,
	pub flush_interval: Duration,
	pub connect_timeout: Duration,
	pub backoff: BackoffTable,
	pub alert_threshold: u32,
	pub batch_size: usize,
	pub channels: Vec<String>,
	pub auth_error_codes: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct FetcherSettings {
	pub viewer_every: Duration,
	pub viewer_scan: Duration,
	pub payer_every: Duration,
	pub payer_scan: Duration,
	pub thumbnail_every: Duration,
	pub thumbnail_scan: Duration,
	pub payer_page_size: u32,
	pub payer_max_pages: u32,
	pub rate_limit_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct CredentialSettings {
	/// Static fallback token used when scraping yields nothing.
	pub token: Option<SecretString>,
	pub clearance: Option<SecretString>,
	pub cookies: Option<SecretString>,
	pub refresh_cooldown: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct NotifySettings {
	pub telegram_bot_token: Option<SecretString>,
	pub telegram_chat_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (`sqlite:`, `postgres:`, `mysql:`). Unset keeps data in memory.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	provider: FileProviderSettings,

	#[serde(default)]
	poller: FilePollerSettings,

	#[serde(default)]
	ingest: FileIngestSettings,

	#[serde(default)]
	fetchers: FileFetcherSettings,

	#[serde(default)]
	credentials: FileCredentialSettings,

	#[serde(default)]
	notify: FileNotifySettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	casts: Vec<FileCast>,

	#[serde(default)]
	payer_accounts: BTreeMap<String, String>,

	dry_run: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileProviderSettings {
	base_url: Option<String>,
	thumbnail_base: Option<String>,
	user_agent: Option<String>,
	accept_language: Option<String>,
	request_timeout_secs: Option<u64>,
	credential_page: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePollerSettings {
	interval_secs: Option<u64>,
	politeness_delay_ms: Option<u64>,
	cast_reload_secs: Option<u64>,
	status_report_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileIngestSettings {
	ws_url: Option<String>,
	origin: Option<String>,
	keepalive_secs: Option<u64>,
	flush_secs: Option<u64>,
	connect_timeout_secs: Option<u64>,
	backoff_secs: Option<Vec<u64>>,
	alert_threshold: Option<u32>,
	batch_size: Option<usize>,
	channels: Option<Vec<String>>,
	auth_error_codes: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileFetcherSettings {
	viewer_every_secs: Option<u64>,
	viewer_scan_secs: Option<u64>,
	payer_every_secs: Option<u64>,
	payer_scan_secs: Option<u64>,
	thumbnail_every_secs: Option<u64>,
	thumbnail_scan_secs: Option<u64>,
	payer_page_size: Option<u32>,
	payer_max_pages: Option<u32>,
	rate_limit_wait_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCredentialSettings {
	token: Option<String>,
	clearance: Option<String>,
	cookies: Option<String>,
	refresh_cooldown_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileNotifySettings {
	telegram_bot_token: Option<String>,
	telegram_chat_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileCast {
	name: String,
	account_id: String,
	display_name: Option<String>,
	channel_id: Option<u64>,
	source: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn secs(v: Option<u64>, default: u64) -> Duration {
	Duration::from_secs(v.filter(|s| *s > 0).unwrap_or(default))
}

impl CollectorConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let backoff = match file.ingest.backoff_secs {
			Some(steps) => BackoffTable::from_secs(&steps).map_err(|e| anyhow!("ingest.backoff_secs: {e}"))?,
			None => BackoffTable::default(),
		};

		let casts = file
			.casts
			.into_iter()
			.map(|c| {
				let name = CastName::new(c.name).context("casts: invalid name")?;
				let account = AccountId::new(c.account_id).with_context(|| format!("cast {name}: invalid account_id"))?;
				let source = match non_blank(c.source) {
					Some(s) => s
						.parse::<CastSource>()
						.with_context(|| format!("cast {name}: invalid source"))?,
					None => CastSource::Owned,
				};
				let mut cast = Cast::new(name, account).with_source(source);
				cast.display_name = non_blank(c.display_name);
				cast.channel_id = c.channel_id.filter(|id| *id > 0).map(ChannelId::new);
				Ok(cast)
			})
			.collect::<anyhow::Result<Vec<_>>>()?;

		let payer_accounts = file
			.payer_accounts
			.into_iter()
			.filter(|(_, uid)| !uid.trim().is_empty())
			.map(|(account, uid)| {
				let account = AccountId::new(account).context("payer_accounts: invalid account id")?;
				Ok((account, uid.trim().to_string()))
			})
			.collect::<anyhow::Result<BTreeMap<_, _>>>()?;

		Ok(Self {
			server: ServerSettings {
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
			},
			provider: ProviderSettings {
				base_url: non_blank(file.provider.base_url).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
				thumbnail_base: non_blank(file.provider.thumbnail_base)
					.unwrap_or_else(|| DEFAULT_THUMBNAIL_BASE.to_string()),
				user_agent: non_blank(file.provider.user_agent).unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
				accept_language: non_blank(file.provider.accept_language)
					.unwrap_or_else(|| "ja,en-US;q=0.9".to_string()),
				request_timeout: secs(file.provider.request_timeout_secs, 15),
				credential_page: non_blank(file.provider.credential_page).unwrap_or_else(|| "/".to_string()),
			},
			poller: PollerSettings {
				interval: secs(file.poller.interval_secs, 60),
				politeness_delay: Duration::from_millis(file.poller.politeness_delay_ms.unwrap_or(2_000)),
				cast_reload_interval: secs(file.poller.cast_reload_secs, 300),
				status_report_interval: secs(file.poller.status_report_secs, 60),
			},
			ingest: IngestSettings {
				ws_url: non_blank(file.ingest.ws_url).unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
				origin: non_blank(file.ingest.origin).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
				keepalive: secs(file.ingest.keepalive_secs, 25),
				flush_interval: secs(file.ingest.flush_secs, 30),
				connect_timeout: secs(file.ingest.connect_timeout_secs, 10),
				backoff,
				alert_threshold: file.ingest.alert_threshold.filter(|t| *t > 0).unwrap_or(3),
				batch_size: file.ingest.batch_size.filter(|b| *b > 0).unwrap_or(500),
				channels: file
					.ingest
					.channels
					.filter(|c| !c.is_empty())
					.unwrap_or_else(|| DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect()),
				auth_error_codes: file
					.ingest
					.auth_error_codes
					.filter(|c| !c.is_empty())
					.unwrap_or_else(|| DEFAULT_AUTH_ERROR_CODES.to_vec()),
			},
			fetchers: FetcherSettings {
				viewer_every: secs(file.fetchers.viewer_every_secs, 180),
				viewer_scan: secs(file.fetchers.viewer_scan_secs, 30),
				payer_every: secs(file.fetchers.payer_every_secs, 3_600),
				payer_scan: secs(file.fetchers.payer_scan_secs, 60),
				thumbnail_every: secs(file.fetchers.thumbnail_every_secs, 300),
				thumbnail_scan: secs(file.fetchers.thumbnail_scan_secs, 60),
				payer_page_size: file.fetchers.payer_page_size.filter(|v| *v > 0).unwrap_or(100),
				payer_max_pages: file.fetchers.payer_max_pages.filter(|v| *v > 0).unwrap_or(50),
				rate_limit_wait: secs(file.fetchers.rate_limit_wait_secs, 10),
			},
			credentials: CredentialSettings {
				token: non_blank(file.credentials.token).map(SecretString::new),
				clearance: non_blank(file.credentials.clearance).map(SecretString::new),
				cookies: non_blank(file.credentials.cookies).map(SecretString::new),
				refresh_cooldown: secs(file.credentials.refresh_cooldown_secs, 5),
			},
			notify: NotifySettings {
				telegram_bot_token: non_blank(file.notify.telegram_bot_token).map(SecretString::new),
				telegram_chat_id: non_blank(file.notify.telegram_chat_id),
			},
			persistence: PersistenceSettings {
				database_url: non_blank(file.persistence.database_url),
			},
			casts,
			payer_accounts,
			dry_run: file.dry_run.unwrap_or(false),
		})
	}

	/// Statically configured credential, if a token or any cookie is set.
	pub fn static_credential(&self) -> Option<Credential> {
		let c = &self.credentials;
		if c.token.is_none() && c.clearance.is_none() && c.cookies.is_none() {
			return None;
		}
		Some(Credential {
			token: c.token.clone().unwrap_or_else(|| SecretString::new(String::new())),
			clearance: c.clearance.clone(),
			cookies: c.cookies.clone(),
		})
	}

	pub fn stripchat_config(&self) -> StripchatConfig {
		StripchatConfig {
			base_url: self.provider.base_url.clone(),
			thumbnail_base: self.provider.thumbnail_base.clone(),
			user_agent: self.provider.user_agent.clone(),
			accept_language: self.provider.accept_language.clone(),
			request_timeout: self.provider.request_timeout,
			credential_page: self.provider.credential_page.clone(),
			static_credential: self.static_credential(),
		}
	}

	pub fn ingestion_config(&self) -> IngestionConfig {
		IngestionConfig {
			ws_url: self.ingest.ws_url.clone(),
			keepalive_interval: self.ingest.keepalive,
			flush_interval: self.ingest.flush_interval,
			connect_timeout: self.ingest.connect_timeout,
			backoff: self.ingest.backoff.clone(),
			alert_threshold: self.ingest.alert_threshold,
			channels: self.ingest.channels.clone(),
			batch_size: self.ingest.batch_size,
			auth_error_codes: self.ingest.auth_error_codes.clone(),
			user_agent: self.provider.user_agent.clone(),
			origin: self.ingest.origin.clone(),
			accept_language: self.provider.accept_language.clone(),
			ws_connector: None,
		}
	}

	pub fn orchestrator_config(&self) -> OrchestratorConfig {
		OrchestratorConfig {
			poll_interval: self.poller.interval,
			politeness_delay: self.poller.politeness_delay,
			cast_reload_interval: self.poller.cast_reload_interval,
			status_report_interval: self.poller.status_report_interval,
			refresh_cooldown: self.credentials.refresh_cooldown,
			seed_casts: self.casts.clone(),
			ingestion: self.ingestion_config(),
			fetchers: FetcherConfig {
				viewer_every: self.fetchers.viewer_every,
				viewer_scan: self.fetchers.viewer_scan,
				payer_every: self.fetchers.payer_every,
				payer_scan: self.fetchers.payer_scan,
				thumbnail_every: self.fetchers.thumbnail_every,
				thumbnail_scan: self.fetchers.thumbnail_scan,
				politeness_delay: self.poller.politeness_delay,
				payer_page_size: self.fetchers.payer_page_size,
				payer_max_pages: self.fetchers.payer_max_pages,
				rate_limit_wait: self.fetchers.rate_limit_wait,
				payer_accounts: self.payer_accounts.clone(),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut CollectorConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("CASTWATCH_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = var("CASTWATCH_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("CASTWATCH_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("CASTWATCH_WS_URL") {
		cfg.ingest.ws_url = v;
		info!("ingest config: ws_url overridden by env");
	}

	if let Some(v) = var("CASTWATCH_PROVIDER_BASE_URL") {
		cfg.provider.base_url = v;
		info!("provider config: base_url overridden by env");
	}

	if let Some(v) = var("CASTWATCH_TOKEN") {
		cfg.credentials.token = Some(SecretString::new(v));
		info!("credentials: token overridden by env");
	}

	if let Some(v) = var("CASTWATCH_CLEARANCE") {
		cfg.credentials.clearance = Some(SecretString::new(v));
		info!("credentials: clearance overridden by env");
	}

	if let Some(v) = var("CASTWATCH_COOKIES") {
		cfg.credentials.cookies = Some(SecretString::new(v));
		info!("credentials: cookies overridden by env");
	}

	if let Some(v) = var("CASTWATCH_TELEGRAM_BOT_TOKEN") {
		cfg.notify.telegram_bot_token = Some(SecretString::new(v));
		info!("notify: telegram_bot_token overridden by env");
	}

	if let Some(v) = var("CASTWATCH_TELEGRAM_CHAT_ID") {
		cfg.notify.telegram_chat_id = Some(v);
		info!("notify: telegram_chat_id overridden by env");
	}

	if let Some(v) = var("CASTWATCH_POLL_INTERVAL_SECS") {
		match v.parse::<u64>() {
			Ok(s) if s > 0 => {
				cfg.poller.interval = Duration::from_secs(s);
				info!(secs = s, "poller config: interval overridden by env");
			}
			_ => warn!(value = %v, "ignoring invalid CASTWATCH_POLL_INTERVAL_SECS"),
		}
	}

	if let Some(v) = var("CASTWATCH_DRY_RUN")
		&& let Some(dry_run) = parse_env_bool(&v)
	{
		cfg.dry_run = dry_run;
		info!(dry_run, "dry_run overridden by env");
	}

	if cfg.notify.telegram_bot_token.is_some() != cfg.notify.telegram_chat_id.is_some() {
		warn!("notify config: telegram needs both bot token and chat id; falling back to log notifications");
	}
}

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use castwatch_domain::{CastName, ChannelId};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, COOKIE, SET_COOKIE, USER_AGENT};
use tracing::{debug, info, warn};

use super::parse::{
	clearance_from_set_cookie, config_token, extract_preloaded_state, parse_cam_status, parse_payers, parse_viewers,
	preloaded_token,
};
use super::{DEFAULT_BASE_URL, DEFAULT_THUMBNAIL_BASE, DEFAULT_USER_AGENT};
use crate::{Credential, CredentialSource, PayerEntry, ProviderApi, ProviderError, StatusReport, ViewerEntry};

#[derive(Debug, Clone)]
pub struct StripchatConfig {
	pub base_url: String,
	pub thumbnail_base: String,
	pub user_agent: String,
	pub accept_language: String,
	pub request_timeout: Duration,

	/// Page scraped for the preloaded state (path under `base_url`).
	pub credential_page: String,

	/// Used when scraping yields no token.
	pub static_credential: Option<Credential>,
}

impl Default for StripchatConfig {
	fn default() -> Self {
		Self {
			base_url: DEFAULT_BASE_URL.to_string(),
			thumbnail_base: DEFAULT_THUMBNAIL_BASE.to_string(),
			user_agent: DEFAULT_USER_AGENT.to_string(),
			accept_language: "ja,en-US;q=0.9".to_string(),
			request_timeout: Duration::from_secs(15),
			credential_page: "/".to_string(),
			static_credential: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct StripchatClient {
	cfg: StripchatConfig,
	client: reqwest::Client,
}

impl StripchatClient {
	pub fn new(cfg: StripchatConfig) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(cfg.request_timeout)
			.build()
			.context("build provider http client")?;
		Ok(Self { cfg, client })
	}

	fn url(&self, path: &str) -> String {
		format!(
			"{}/{}",
			self.cfg.base_url.trim_end_matches('/'),
			path.trim_start_matches('/')
		)
	}

	fn get_json(&self, url: String, credential: Option<&Credential>) -> reqwest::RequestBuilder {
		let mut req = self
			.client
			.get(url)
			.header(USER_AGENT, &self.cfg.user_agent)
			.header(ACCEPT, "application/json");
		if let Some(cred) = credential
			&& let Some(cookie) = cred.cookie_header()
		{
			req = req.header(COOKIE, cookie);
		}
		req
	}

	async fn send_checked(req: reqwest::RequestBuilder) -> Result<String, ProviderError> {
		let resp = req.send().await.map_err(|e| ProviderError::Transport(e.to_string()))?;
		let status = resp.status();
		if status != StatusCode::OK {
			return Err(ProviderError::from_status(status.as_u16()));
		}
		resp.text().await.map_err(|e| ProviderError::Transport(e.to_string()))
	}

	/// Token from the page's preloaded state, with the clearance cookie it set.
	async fn scrape_page_credential(&self) -> anyhow::Result<Option<Credential>> {
		let resp = self
			.client
			.get(self.url(&self.cfg.credential_page))
			.header(USER_AGENT, &self.cfg.user_agent)
			.header(ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9")
			.header(ACCEPT_LANGUAGE, &self.cfg.accept_language)
			.send()
			.await
			.context("provider page")?;

		if !resp.status().is_success() {
			return Err(anyhow!("provider page failed: status={}", resp.status()));
		}

		let clearance = resp
			.headers()
			.get_all(SET_COOKIE)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.filter_map(clearance_from_set_cookie)
			.last();
		let html = resp.text().await.context("read provider page")?;

		let Some(token) = extract_preloaded_state(&html).as_ref().and_then(preloaded_token) else {
			return Ok(None);
		};
		let mut credential = Credential::new(token);
		if let Some(c) = clearance {
			credential = credential.with_clearance(c);
		}
		Ok(Some(credential))
	}

	async fn config_credential(&self) -> anyhow::Result<Option<Credential>> {
		let resp = self
			.client
			.get(self.url("/api/front/v2/config"))
			.header(USER_AGENT, &self.cfg.user_agent)
			.header(ACCEPT, "application/json")
			.header(ACCEPT_LANGUAGE, &self.cfg.accept_language)
			.send()
			.await
			.context("provider config")?;

		if !resp.status().is_success() {
			return Err(anyhow!("provider config failed: status={}", resp.status()));
		}
		let body: serde_json::Value = resp.json().await.context("parse provider config")?;
		Ok(config_token(&body).map(Credential::new))
	}

	/// Carry the static cookie blob over to a scraped credential.
	fn merge_static(&self, mut credential: Credential) -> Credential {
		if let Some(fallback) = &self.cfg.static_credential {
			if credential.cookies.is_none() {
				credential.cookies = fallback.cookies.clone();
			}
			if credential.clearance.is_none() {
				credential.clearance = fallback.clearance.clone();
			}
		}
		credential
	}
}

#[async_trait::async_trait]
impl CredentialSource for StripchatClient {
	async fn fetch_credential(&self) -> anyhow::Result<Credential> {
		match self.scrape_page_credential().await {
			Ok(Some(c)) => {
				info!("credential obtained from page state");
				return Ok(self.merge_static(c));
			}
			Ok(None) => debug!("page state carried no token"),
			Err(e) => debug!(error = %e, "page scrape failed"),
		}

		match self.config_credential().await {
			Ok(Some(c)) => {
				info!("credential obtained from config endpoint");
				return Ok(self.merge_static(c));
			}
			Ok(None) => debug!("config endpoint carried no token"),
			Err(e) => debug!(error = %e, "config fetch failed"),
		}

		if let Some(c) = &self.cfg.static_credential
			&& c.has_token()
		{
			warn!("credential scraping failed; using configured credential");
			return Ok(c.clone());
		}
		Err(anyhow!("no credential available"))
	}
}

#[async_trait::async_trait]
impl ProviderApi for StripchatClient {
	async fn cam_status(&self, cast: &CastName, credential: &Credential) -> Result<StatusReport, ProviderError> {
		let url = self.url(&format!(
			"/api/front/v2/models/username/{}/cam",
			urlencoding::encode(cast.as_str())
		));
		let body = Self::send_checked(self.get_json(url, Some(credential))).await?;
		parse_cam_status(&body)
	}

	async fn viewers(&self, cast: &CastName, credential: &Credential) -> Result<Vec<ViewerEntry>, ProviderError> {
		let url = self.url(&format!(
			"/api/front/models/username/{}/groupShow/members",
			urlencoding::encode(cast.as_str())
		));
		let mut req = self.get_json(url, Some(credential));
		if credential.has_token() {
			req = req.header(AUTHORIZATION, format!("Bearer {}", credential.token.expose().trim()));
		}
		let body = Self::send_checked(req).await?;
		parse_viewers(&body)
	}

	async fn payers_page(
		&self,
		provider_user_id: &str,
		offset: u32,
		limit: u32,
		credential: &Credential,
	) -> Result<Vec<PayerEntry>, ProviderError> {
		let url = self.url(&format!(
			"/api/front/users/{}/transactions/users?offset={offset}&limit={limit}&sort=lastPaid&order=desc",
			urlencoding::encode(provider_user_id)
		));
		let body = Self::send_checked(self.get_json(url, Some(credential))).await?;
		parse_payers(&body)
	}

	fn thumbnail_url(&self, channel_id: ChannelId) -> String {
		format!("{}/{}_webp", self.cfg.thumbnail_base.trim_end_matches('/'), channel_id)
	}
}

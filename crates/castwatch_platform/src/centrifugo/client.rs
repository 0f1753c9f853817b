#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use castwatch_domain::{AccountId, CastName, ChannelId, EventKind, SessionId};
use castwatch_util::backoff::BackoffTable;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::buffer::{EventBuffer, flush};
use super::chat::{model_event_type, parse_chat, system_event};
use super::frames::{self, CommandIds, InboundFrame, KEEPALIVE};
use super::{ChannelKind, DEFAULT_AUTH_ERROR_CODES, DEFAULT_CHANNELS, DEFAULT_WS_URL, subscription_set};
use crate::{Credential, Notifier, RefreshSignal, Store, unix_ms_now};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type CentrifugoWs =
	tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Request) -> BoxFuture<'static, anyhow::Result<CentrifugoWs>> + Send + Sync>;

#[derive(Clone)]
pub struct IngestionConfig {
	pub ws_url: String,
	pub keepalive_interval: Duration,
	pub flush_interval: Duration,
	pub connect_timeout: Duration,
	pub backoff: BackoffTable,

	/// Consecutive failures at which the notifier is alerted and a refresh is requested.
	pub alert_threshold: u32,

	/// Unscoped channel names.
	pub channels: Vec<String>,
	pub batch_size: usize,
	pub auth_error_codes: Vec<u32>,

	pub user_agent: String,
	pub origin: String,
	pub accept_language: String,

	/// Override the socket dialer (tests).
	pub ws_connector: Option<WsConnector>,
}

impl Default for IngestionConfig {
	fn default() -> Self {
		Self {
			ws_url: DEFAULT_WS_URL.to_string(),
			keepalive_interval: Duration::from_secs(25),
			flush_interval: Duration::from_secs(30),
			connect_timeout: Duration::from_secs(10),
			backoff: BackoffTable::default(),
			alert_threshold: 3,
			channels: DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect(),
			batch_size: 500,
			auth_error_codes: DEFAULT_AUTH_ERROR_CODES.to_vec(),
			user_agent: crate::stripchat::DEFAULT_USER_AGENT.to_string(),
			origin: "https://stripchat.com".to_string(),
			accept_language: "ja,en-US;q=0.9".to_string(),
			ws_connector: None,
		}
	}
}

/// Which cast and session a client ingests for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionTarget {
	pub cast: CastName,
	pub account_id: AccountId,
	pub channel_id: ChannelId,
	pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
	#[default]
	Disconnected,
	Connecting,
	Authenticating,
	Subscribing,
	Streaming,
}

impl ClientState {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Disconnected => "disconnected",
			Self::Connecting => "connecting",
			Self::Authenticating => "authenticating",
			Self::Subscribing => "subscribing",
			Self::Streaming => "streaming",
		}
	}
}

/// How one connection attempt ended.
#[derive(Debug)]
enum AttemptEnd {
	Stopped,
	AuthRejected { code: u32, message: String },
	Closed { code: Option<u16> },
	Failed(anyhow::Error),
}

struct Shared {
	cfg: IngestionConfig,
	target: IngestionTarget,
	store: Arc<dyn Store>,
	notifier: Arc<dyn Notifier>,
	refresh: Arc<RefreshSignal>,
	buffer: EventBuffer,
	credential: watch::Sender<Credential>,
	state: watch::Sender<ClientState>,
	message_count: AtomicU64,
	tip_total: AtomicU64,
	consecutive_failures: AtomicU32,

	/// Wire ids for events without a provider message id.
	instance: Uuid,
	received: AtomicU64,
}

struct Running {
	stop: CancellationToken,
	drain: CancellationToken,
	reader: JoinHandle<()>,
	flusher: JoinHandle<()>,
}

/// Per-cast pub/sub client: one read loop and one flush loop while running.
pub struct IngestionClient {
	shared: Arc<Shared>,
	running: Mutex<Option<Running>>,
}

impl IngestionClient {
	pub fn new(
		cfg: IngestionConfig,
		target: IngestionTarget,
		credential: Credential,
		store: Arc<dyn Store>,
		notifier: Arc<dyn Notifier>,
		refresh: Arc<RefreshSignal>,
	) -> Self {
		let (credential, _) = watch::channel(credential);
		let (state, _) = watch::channel(ClientState::Disconnected);
		Self {
			shared: Arc::new(Shared {
				cfg,
				target,
				store,
				notifier,
				refresh,
				buffer: EventBuffer::new(),
				credential,
				state,
				message_count: AtomicU64::new(0),
				tip_total: AtomicU64::new(0),
				consecutive_failures: AtomicU32::new(0),
				instance: Uuid::new_v4(),
				received: AtomicU64::new(0),
			}),
			running: Mutex::new(None),
		}
	}

	pub fn target(&self) -> &IngestionTarget {
		&self.shared.target
	}

	/// Start the background loops. No-op while already running.
	pub fn connect(&self) {
		let mut running = self.running.lock();
		if running.as_ref().is_some_and(|r| !r.reader.is_finished()) {
			return;
		}

		let stop = CancellationToken::new();
		let drain = CancellationToken::new();
		let reader = tokio::spawn(self.shared.clone().run(stop.clone()));
		let flusher = tokio::spawn(self.shared.clone().flush_loop(drain.clone()));
		*running = Some(Running {
			stop,
			drain,
			reader,
			flusher,
		});
		metrics::gauge!("castwatch_active_clients").increment(1.0);
	}

	/// Stop the loops, close the socket and flush what is left.
	pub async fn disconnect(&self) {
		let running = self.running.lock().take();
		match running {
			Some(r) => {
				r.stop.cancel();
				if let Err(e) = r.reader.await {
					warn!(cast = %self.shared.target.cast, error = %e, "read loop join failed");
				}
				r.drain.cancel();
				if let Err(e) = r.flusher.await {
					warn!(cast = %self.shared.target.cast, error = %e, "flush loop join failed");
				}
				metrics::gauge!("castwatch_active_clients").decrement(1.0);
			}
			None => {
				flush(&self.shared.buffer, self.shared.store.as_ref(), self.shared.cfg.batch_size).await;
			}
		}
		self.shared.state.send_replace(ClientState::Disconnected);
		info!(
			cast = %self.shared.target.cast,
			messages = self.message_count(),
			tips = self.tip_total(),
			"ingestion client stopped"
		);
	}

	pub fn is_running(&self) -> bool {
		self.running.lock().as_ref().is_some_and(|r| !r.reader.is_finished())
	}

	/// Takes effect on the next connection attempt; a live connection is kept.
	pub fn update_credential(&self, credential: Credential) {
		self.shared.credential.send_replace(credential);
	}

	pub fn credential(&self) -> Credential {
		self.shared.credential.borrow().clone()
	}

	pub fn message_count(&self) -> u64 {
		self.shared.message_count.load(Ordering::Relaxed)
	}

	pub fn tip_total(&self) -> u64 {
		self.shared.tip_total.load(Ordering::Relaxed)
	}

	pub fn consecutive_failures(&self) -> u32 {
		self.shared.consecutive_failures.load(Ordering::Relaxed)
	}

	pub fn state(&self) -> ClientState {
		*self.shared.state.borrow()
	}

	pub fn buffered(&self) -> usize {
		self.shared.buffer.len()
	}
}

impl Shared {
	fn set_state(&self, state: ClientState) {
		self.state.send_replace(state);
	}

	async fn run(self: Arc<Self>, stop: CancellationToken) {
		let cast = self.target.cast.clone();
		let mut failures: u32 = 0;

		loop {
			let end = self.run_attempt(&stop, &mut failures).await;
			self.set_state(ClientState::Disconnected);
			if stop.is_cancelled() || matches!(end, AttemptEnd::Stopped) {
				break;
			}

			match &end {
				AttemptEnd::AuthRejected { code, message } => {
					warn!(%cast, code, %message, "pub/sub rejected credentials");
					metrics::counter!("castwatch_auth_failures_total").increment(1);
					self.refresh.raise();
				}
				AttemptEnd::Closed { code: Some(code) } if self.is_auth_code(u32::from(*code)) => {
					warn!(%cast, code, "pub/sub closed with auth code");
					metrics::counter!("castwatch_auth_failures_total").increment(1);
					self.refresh.raise();
				}
				AttemptEnd::Closed { code } => info!(%cast, ?code, "pub/sub connection closed"),
				AttemptEnd::Failed(e) => warn!(%cast, error = %e, "pub/sub connection failed"),
				AttemptEnd::Stopped => {}
			}

			failures = failures.saturating_add(1);
			self.consecutive_failures.store(failures, Ordering::Relaxed);
			metrics::counter!("castwatch_reconnects_total").increment(1);

			if failures >= self.cfg.alert_threshold {
				self.refresh.raise();
				if failures == self.cfg.alert_threshold {
					warn!(%cast, failures, "pub/sub failure threshold reached");
					self.notifier
						.notify(&format!(
							"{cast}: real-time connection failed {failures} times in a row; refreshing credentials"
						))
						.await;
				}
			}

			let delay = self.cfg.backoff.delay_for(failures);
			info!(%cast, failures, ?delay, "reconnecting");
			tokio::select! {
				_ = stop.cancelled() => break,
				_ = sleep(delay) => {}
			}
		}

		self.set_state(ClientState::Disconnected);
		debug!(%cast, "read loop stopped");
	}

	fn is_auth_code(&self, code: u32) -> bool {
		self.cfg.auth_error_codes.contains(&code)
	}

	fn build_request(&self, credential: &Credential) -> anyhow::Result<Request> {
		let mut request = self
			.cfg
			.ws_url
			.as_str()
			.into_client_request()
			.context("build pub/sub request")?;
		let headers = request.headers_mut();
		headers.insert(
			header::USER_AGENT,
			HeaderValue::from_str(&self.cfg.user_agent).context("user-agent header")?,
		);
		headers.insert(
			header::ORIGIN,
			HeaderValue::from_str(&self.cfg.origin).context("origin header")?,
		);
		headers.insert(
			header::ACCEPT_LANGUAGE,
			HeaderValue::from_str(&self.cfg.accept_language).context("accept-language header")?,
		);
		if let Some(cookie) = credential.cookie_header() {
			headers.insert(header::COOKIE, HeaderValue::from_str(&cookie).context("cookie header")?);
		}
		Ok(request)
	}

	async fn dial(&self, request: Request) -> anyhow::Result<CentrifugoWs> {
		if let Some(connector) = &self.cfg.ws_connector {
			return connector(request).await;
		}
		let (ws, _resp) = tokio_tungstenite::connect_async(request)
			.await
			.context("connect_async to pub/sub endpoint")?;
		Ok(ws)
	}

	async fn run_attempt(&self, stop: &CancellationToken, failures: &mut u32) -> AttemptEnd {
		let cast = &self.target.cast;
		let credential = self.credential.borrow().clone();

		self.set_state(ClientState::Connecting);
		let request = match self.build_request(&credential) {
			Ok(r) => r,
			Err(e) => return AttemptEnd::Failed(e),
		};
		debug!(%cast, channel_id = %self.target.channel_id, auth = credential.has_token(), "connecting");

		let mut ws = tokio::select! {
			_ = stop.cancelled() => return AttemptEnd::Stopped,
			r = self.dial(request) => match r {
				Ok(ws) => ws,
				Err(e) => return AttemptEnd::Failed(e),
			},
		};

		let mut ids = CommandIds::default();
		self.set_state(ClientState::Authenticating);
		let connect = match frames::connect_command(ids.next_id(), credential.token.expose()) {
			Ok(c) => c,
			Err(e) => return AttemptEnd::Failed(e),
		};
		if let Err(e) = ws.send(Message::Text(connect.into())).await {
			return AttemptEnd::Failed(anyhow::Error::new(e).context("send connect command"));
		}

		let leftover = tokio::select! {
			_ = stop.cancelled() => {
				let _ = ws.close(None).await;
				return AttemptEnd::Stopped;
			}
			r = tokio::time::timeout(self.cfg.connect_timeout, self.await_connect_reply(&mut ws)) => match r {
				Ok(Ok(frames)) => frames,
				Ok(Err(end)) => return end,
				Err(_) => return AttemptEnd::Failed(anyhow!("connect reply timed out")),
			},
		};

		self.set_state(ClientState::Subscribing);
		for channel in subscription_set(self.cfg.channels.as_slice(), self.target.channel_id) {
			let cmd = match frames::subscribe_command(ids.next_id(), &channel) {
				Ok(c) => c,
				Err(e) => return AttemptEnd::Failed(e),
			};
			if let Err(e) = ws.send(Message::Text(cmd.into())).await {
				return AttemptEnd::Failed(anyhow::Error::new(e).context("send subscribe command"));
			}
			debug!(%cast, %channel, "subscribe sent");
		}

		self.set_state(ClientState::Streaming);
		*failures = 0;
		self.consecutive_failures.store(0, Ordering::Relaxed);
		info!(%cast, channel_id = %self.target.channel_id, "pub/sub streaming");

		for frame in leftover {
			self.handle_frame(frame);
		}

		let period = self.cfg.keepalive_interval;
		let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
		keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = stop.cancelled() => {
					let _ = ws.close(None).await;
					return AttemptEnd::Stopped;
				}
				_ = keepalive.tick() => {
					if let Err(e) = ws.send(Message::Text(KEEPALIVE.to_string().into())).await {
						debug!(%cast, error = %e, "keepalive send failed");
					}
				}
				msg = ws.next() => {
					let Some(msg) = msg else {
						return AttemptEnd::Closed { code: None };
					};
					let msg = match msg {
						Ok(m) => m,
						Err(e) => return AttemptEnd::Failed(anyhow::Error::new(e).context("ws read")),
					};

					match msg {
						Message::Text(t) => self.handle_payload(&mut ws, t.as_str()).await,
						Message::Binary(b) => {
							if let Ok(text) = std::str::from_utf8(&b) {
								self.handle_payload(&mut ws, text).await;
							}
						}
						Message::Ping(p) => {
							let _ = ws.send(Message::Pong(p)).await;
						}
						Message::Pong(_) => {}
						Message::Close(frame) => {
							return AttemptEnd::Closed {
								code: frame.map(|f| u16::from(f.code)),
							};
						}
						Message::Frame(_) => {}
					}
				}
			}
		}
	}

	/// Read until the connect reply. Returns the other frames that shared its payload.
	async fn await_connect_reply(&self, ws: &mut CentrifugoWs) -> Result<Vec<InboundFrame>, AttemptEnd> {
		loop {
			let Some(msg) = ws.next().await else {
				return Err(AttemptEnd::Closed { code: None });
			};
			let msg = msg.map_err(|e| AttemptEnd::Failed(anyhow::Error::new(e).context("ws read before connect reply")))?;

			let text = match msg {
				Message::Text(t) => t.as_str().to_string(),
				Message::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
				Message::Ping(p) => {
					let _ = ws.send(Message::Pong(p)).await;
					continue;
				}
				Message::Close(frame) => {
					return Err(AttemptEnd::Closed {
						code: frame.map(|f| u16::from(f.code)),
					});
				}
				_ => continue,
			};

			let mut connected = false;
			let mut ping = false;
			let mut rest = Vec::new();
			for frame in frames::decode_payload(&text) {
				match frame {
					InboundFrame::Error { code, message, .. } => {
						if self.is_auth_code(code) {
							return Err(AttemptEnd::AuthRejected { code, message });
						}
						return Err(AttemptEnd::Failed(anyhow!("connect rejected: code={code} {message}")));
					}
					InboundFrame::Connected { client, .. } => {
						info!(cast = %self.target.cast, client = client.as_deref().unwrap_or(""), "pub/sub connected");
						connected = true;
					}
					InboundFrame::Keepalive => ping = true,
					other => rest.push(other),
				}
			}

			if ping && let Err(e) = ws.send(Message::Text(KEEPALIVE.to_string().into())).await {
				debug!(cast = %self.target.cast, error = %e, "pong send failed");
			}
			if connected {
				return Ok(rest);
			}
			if ping && rest.is_empty() {
				continue;
			}
			return Err(AttemptEnd::Failed(anyhow!("first frame was not a connect reply")));
		}
	}

	async fn handle_payload(&self, ws: &mut CentrifugoWs, payload: &str) {
		let mut ping = false;
		for frame in frames::decode_payload(payload) {
			if matches!(frame, InboundFrame::Keepalive) {
				ping = true;
			} else {
				self.handle_frame(frame);
			}
		}
		// one pong per physical payload, however many pings it carried
		if ping && let Err(e) = ws.send(Message::Text(KEEPALIVE.to_string().into())).await {
			debug!(cast = %self.target.cast, error = %e, "pong send failed");
		}
	}

	fn next_wire_id(&self) -> String {
		let n = self.received.fetch_add(1, Ordering::Relaxed);
		format!("{}:{n}", self.instance)
	}

	fn handle_frame(&self, frame: InboundFrame) {
		let cast = &self.target.cast;
		match frame {
			InboundFrame::Keepalive | InboundFrame::Other | InboundFrame::Connected { .. } => {}
			InboundFrame::Subscribed { id } => debug!(%cast, ?id, "subscription confirmed"),
			InboundFrame::Error { id, code, message } => warn!(%cast, ?id, code, %message, "command error"),
			InboundFrame::Push { channel, data } => self.handle_push(&channel, &data),
		}
	}

	fn handle_push(&self, channel: &str, data: &serde_json::Value) {
		let cast = &self.target.cast;
		let received = unix_ms_now();
		let base = frames::channel_base(channel);

		match ChannelKind::from_base(base) {
			ChannelKind::Chat => {
				let chat = match parse_chat(data) {
					Ok(c) => c,
					Err(e) => {
						debug!(%cast, error = %e, "dropping chat payload");
						return;
					}
				};
				self.message_count.fetch_add(1, Ordering::Relaxed);
				if chat.kind == EventKind::Tip {
					self.tip_total.fetch_add(chat.tokens, Ordering::Relaxed);
					info!(%cast, user = %chat.user_name, tokens = chat.tokens, "tip");
				} else {
					debug!(%cast, user = %chat.user_name, "chat");
				}
				metrics::counter!("castwatch_ingest_events_total", "kind" => chat.kind.as_str()).increment(1);
				let wire_id = match &chat.message_id {
					Some(id) => format!("msg:{id}"),
					None => self.next_wire_id(),
				};
				self.buffer.push(chat.into_event(
					cast,
					&self.target.account_id,
					self.target.session_id,
					base,
					received,
					wire_id,
				));
			}
			ChannelKind::ModelEvent => {
				let event_type = model_event_type(data);
				info!(%cast, event = %event_type, "model event");
				metrics::counter!("castwatch_ingest_events_total", "kind" => EventKind::System.as_str()).increment(1);
				let wire_id = self.next_wire_id();
				self.buffer.push(system_event(
					event_type,
					cast,
					&self.target.account_id,
					self.target.session_id,
					base,
					received,
					wire_id,
				));
			}
			ChannelKind::UserUpdated => debug!(%cast, "user updated"),
			ChannelKind::ClearChat => debug!(%cast, "chat cleared"),
			ChannelKind::Unknown => debug!(%cast, %channel, "push on unknown channel"),
		}
	}

	async fn flush_loop(self: Arc<Self>, drain: CancellationToken) {
		let period = self.cfg.flush_interval;
		let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = drain.cancelled() => break,
				_ = ticker.tick() => {
					flush(&self.buffer, self.store.as_ref(), self.cfg.batch_size).await;
				}
			}
		}

		let outcome = flush(&self.buffer, self.store.as_ref(), self.cfg.batch_size).await;
		if outcome.requeued > 0 {
			warn!(cast = %self.target.cast, requeued = outcome.requeued, "final flush left events unpersisted");
		}
	}
}

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use castwatch_platform::{Credential, CredentialSource, RefreshSignal};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::monitor::clients::ClientRegistry;

/// Waits on the shared refresh signal and replaces the credential everywhere.
pub struct CredentialRefresher {
	source: Arc<dyn CredentialSource>,
	signal: Arc<RefreshSignal>,
	current: Arc<watch::Sender<Credential>>,
	clients: ClientRegistry,
	cooldown: Duration,
}

impl CredentialRefresher {
	pub fn new(
		source: Arc<dyn CredentialSource>,
		signal: Arc<RefreshSignal>,
		current: Arc<watch::Sender<Credential>>,
		clients: ClientRegistry,
		cooldown: Duration,
	) -> Self {
		Self {
			source,
			signal,
			current,
			clients,
			cooldown,
		}
	}

	/// Fetch once and push the result to every live client.
	pub async fn refresh_once(&self) -> bool {
		match self.source.fetch_credential().await {
			Ok(credential) if credential.has_token() => {
				self.current.send_replace(credential.clone());
				let updated = self.clients.broadcast_credential(&credential);
				metrics::counter!("castwatch_credential_refreshes_total", "outcome" => "ok").increment(1);
				info!(clients = updated, "credential refreshed");
				true
			}
			Ok(_) => {
				metrics::counter!("castwatch_credential_refreshes_total", "outcome" => "empty").increment(1);
				warn!("credential source returned no token; keeping the current one");
				false
			}
			Err(e) => {
				metrics::counter!("castwatch_credential_refreshes_total", "outcome" => "error").increment(1);
				warn!(error = %e, "credential refresh failed");
				false
			}
		}
	}

	/// Raises that arrive during the cooldown are dropped; a client that still
	/// fails raises again on its next failure.
	pub async fn run(self, stop: CancellationToken) {
		loop {
			tokio::select! {
				_ = stop.cancelled() => break,
				_ = self.signal.wait() => {}
			}

			tokio::select! {
				_ = stop.cancelled() => break,
				_ = self.refresh_once() => {}
			}

			tokio::select! {
				_ = stop.cancelled() => break,
				_ = tokio::time::sleep(self.cooldown) => {}
			}
			self.signal.clear();
		}
		info!("credential refresher stopped");
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use super::*;

	struct CountingSource {
		calls: AtomicU32,
		fail: bool,
	}

	#[async_trait::async_trait]
	impl CredentialSource for CountingSource {
		async fn fetch_credential(&self) -> anyhow::Result<Credential> {
			let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
			if self.fail {
				anyhow::bail!("page unavailable");
			}
			Ok(Credential::new(format!("token-{n}")).with_clearance("cf"))
		}
	}

	fn refresher(fail: bool, cooldown: Duration) -> (CredentialRefresher, Arc<CountingSource>, watch::Receiver<Credential>) {
		let source = Arc::new(CountingSource {
			calls: AtomicU32::new(0),
			fail,
		});
		let (tx, rx) = watch::channel(Credential::new("initial"));
		let refresher = CredentialRefresher::new(
			source.clone(),
			Arc::new(RefreshSignal::new()),
			Arc::new(tx),
			ClientRegistry::new(),
			cooldown,
		);
		(refresher, source, rx)
	}

	#[tokio::test]
	async fn failed_fetch_keeps_current_credential() {
		let (refresher, source, rx) = refresher(true, Duration::ZERO);
		assert!(!refresher.refresh_once().await);
		assert_eq!(source.calls.load(Ordering::SeqCst), 1);
		assert_eq!(rx.borrow().token.expose(), "initial");
	}

	#[tokio::test]
	async fn raises_collapse_and_cooldown_drops_storms() {
		let (refresher, source, mut rx) = refresher(false, Duration::from_millis(200));
		let signal = refresher.signal.clone();
		let stop = CancellationToken::new();
		let task = tokio::spawn(refresher.run(stop.clone()));

		signal.raise();
		signal.raise();
		signal.raise();
		tokio::time::timeout(Duration::from_secs(2), rx.changed())
			.await
			.expect("refresh happened")
			.expect("sender alive");
		assert_eq!(rx.borrow().token.expose(), "token-1");

		// inside the cooldown window
		signal.raise();
		tokio::time::sleep(Duration::from_millis(400)).await;
		assert_eq!(source.calls.load(Ordering::SeqCst), 1);

		// re-armed
		signal.raise();
		tokio::time::timeout(Duration::from_secs(2), rx.changed())
			.await
			.expect("second refresh")
			.expect("sender alive");
		assert_eq!(rx.borrow().token.expose(), "token-2");

		stop.cancel();
		tokio::time::timeout(Duration::from_secs(1), task)
			.await
			.expect("refresher stops")
			.expect("join");
	}
}

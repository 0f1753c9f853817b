#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use castwatch_domain::CastName;
use castwatch_platform::Credential;
use castwatch_platform::centrifugo::IngestionClient;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::monitor::sessions::ClientCounters;

/// Live cast -> its ingestion client. Written only by the orchestrator loop.
#[derive(Clone, Default)]
pub struct ClientRegistry {
	inner: Arc<RwLock<HashMap<CastName, Arc<IngestionClient>>>>,
}

impl ClientRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, cast: CastName, client: Arc<IngestionClient>) -> Option<Arc<IngestionClient>> {
		self.inner.write().insert(cast, client)
	}

	/// Insert, then sync the client to the credential current after insertion.
	/// A rotation that lands before the insert is picked up here; one that lands
	/// after it reaches the client through `broadcast_credential`.
	pub fn register(
		&self,
		cast: CastName,
		client: Arc<IngestionClient>,
		current: &watch::Sender<Credential>,
	) -> Option<Arc<IngestionClient>> {
		let previous = self.insert(cast, client.clone());
		client.update_credential(current.borrow().clone());
		previous
	}

	pub fn remove(&self, cast: &CastName) -> Option<Arc<IngestionClient>> {
		self.inner.write().remove(cast)
	}

	pub fn get(&self, cast: &CastName) -> Option<Arc<IngestionClient>> {
		self.inner.read().get(cast).cloned()
	}

	pub fn contains(&self, cast: &CastName) -> bool {
		self.inner.read().contains_key(cast)
	}

	/// Sorted by cast name.
	pub fn clients(&self) -> Vec<(CastName, Arc<IngestionClient>)> {
		let mut all: Vec<_> = self
			.inner
			.read()
			.iter()
			.map(|(n, c)| (n.clone(), c.clone()))
			.collect();
		all.sort_by(|a, b| a.0.cmp(&b.0));
		all
	}

	pub fn drain(&self) -> Vec<(CastName, Arc<IngestionClient>)> {
		let mut all: Vec<_> = self.inner.write().drain().collect();
		all.sort_by(|a, b| a.0.cmp(&b.0));
		all
	}

	pub fn len(&self) -> usize {
		self.inner.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.read().is_empty()
	}

	/// Push a credential into every client. Returns how many were updated.
	pub fn broadcast_credential(&self, credential: &Credential) -> usize {
		let clients = self.inner.read();
		for client in clients.values() {
			client.update_credential(credential.clone());
		}
		clients.len()
	}

	pub fn totals(&self) -> ClientCounters {
		self.inner
			.read()
			.values()
			.fold(ClientCounters::default(), |acc, c| ClientCounters {
				message_count: acc.message_count + c.message_count(),
				tip_total: acc.tip_total + c.tip_total(),
			})
	}
}

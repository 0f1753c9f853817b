#![forbid(unsafe_code)]

pub mod backoff {
	use std::time::Duration;

	/// Fixed, indexed reconnect delays.
	///
	/// The delay for the n-th consecutive failure is `steps[n - 1]`; counts past the
	/// end of the table clamp to the last entry.
	#[derive(Debug, Clone, PartialEq, Eq)]
	pub struct BackoffTable {
		steps: Vec<Duration>,
	}

	impl BackoffTable {
		/// Build a table from explicit delays (must be non-empty).
		pub fn new(steps: Vec<Duration>) -> Result<Self, String> {
			if steps.is_empty() {
				return Err("backoff table must have at least one entry".to_string());
			}
			Ok(Self { steps })
		}

		/// Build a table from whole seconds.
		pub fn from_secs(secs: &[u64]) -> Result<Self, String> {
			Self::new(secs.iter().copied().map(Duration::from_secs).collect())
		}

		/// Delay to wait after `failures` consecutive failures. Zero failures means no wait.
		pub fn delay_for(&self, failures: u32) -> Duration {
			if failures == 0 {
				return Duration::ZERO;
			}
			let idx = (failures as usize - 1).min(self.steps.len().saturating_sub(1));
			self.steps.get(idx).copied().unwrap_or_default()
		}

		pub fn steps(&self) -> &[Duration] {
			&self.steps
		}
	}

	impl Default for BackoffTable {
		fn default() -> Self {
			Self {
				steps: [5, 10, 30, 60].into_iter().map(Duration::from_secs).collect(),
			}
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn follows_table_then_clamps() {
			let t = BackoffTable::default();
			assert_eq!(t.delay_for(0), Duration::ZERO);
			assert_eq!(t.delay_for(1), Duration::from_secs(5));
			assert_eq!(t.delay_for(2), Duration::from_secs(10));
			assert_eq!(t.delay_for(3), Duration::from_secs(30));
			assert_eq!(t.delay_for(4), Duration::from_secs(60));
			assert_eq!(t.delay_for(5), Duration::from_secs(60));
			assert_eq!(t.delay_for(u32::MAX), Duration::from_secs(60));
		}

		#[test]
		fn single_entry_table() {
			let t = BackoffTable::from_secs(&[7]).unwrap();
			assert_eq!(t.delay_for(1), Duration::from_secs(7));
			assert_eq!(t.delay_for(9), Duration::from_secs(7));
		}

		#[test]
		fn rejects_empty_table() {
			assert!(BackoffTable::new(Vec::new()).is_err());
			assert!(BackoffTable::from_secs(&[]).is_err());
		}
	}
}

pub mod cadence {
	use std::collections::HashMap;
	use std::hash::Hash;
	use std::time::{Duration, Instant};

	/// Per-key "last ran at" gate.
	///
	/// Lets a loop that scans often act on each key at a slower effective cadence
	/// without one timer per key.
	#[derive(Debug, Clone)]
	pub struct CooldownGate<K> {
		every: Duration,
		last_run: HashMap<K, Instant>,
	}

	impl<K: Eq + Hash + Clone> CooldownGate<K> {
		pub fn new(every: Duration) -> Self {
			Self {
				every,
				last_run: HashMap::new(),
			}
		}

		pub fn every(&self) -> Duration {
			self.every
		}

		/// Whether `key` has never run or last ran at least `every` ago.
		pub fn is_due(&self, key: &K, now: Instant) -> bool {
			match self.last_run.get(key) {
				Some(last) => now.saturating_duration_since(*last) >= self.every,
				None => true,
			}
		}

		pub fn mark(&mut self, key: K, now: Instant) {
			self.last_run.insert(key, now);
		}

		/// Check and mark in one step.
		pub fn try_acquire(&mut self, key: &K, now: Instant) -> bool {
			if self.is_due(key, now) {
				self.mark(key.clone(), now);
				true
			} else {
				false
			}
		}

		pub fn forget(&mut self, key: &K) {
			self.last_run.remove(key);
		}

		/// Drop entries for keys that are no longer relevant.
		pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
			self.last_run.retain(|k, _| keep(k));
		}

		pub fn len(&self) -> usize {
			self.last_run.len()
		}

		pub fn is_empty(&self) -> bool {
			self.last_run.is_empty()
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn first_run_is_always_due() {
			let gate: CooldownGate<&str> = CooldownGate::new(Duration::from_secs(180));
			assert!(gate.is_due(&"risa", Instant::now()));
		}

		#[test]
		fn enforces_cadence_per_key() {
			let mut gate = CooldownGate::new(Duration::from_secs(180));
			let t0 = Instant::now();

			assert!(gate.try_acquire(&"a", t0));
			assert!(!gate.try_acquire(&"a", t0 + Duration::from_secs(30)));
			assert!(gate.try_acquire(&"b", t0 + Duration::from_secs(30)));
			assert!(gate.try_acquire(&"a", t0 + Duration::from_secs(180)));
		}

		#[test]
		fn forget_and_retain() {
			let mut gate = CooldownGate::new(Duration::from_secs(60));
			let t0 = Instant::now();
			gate.mark("a", t0);
			gate.mark("b", t0);
			gate.forget(&"a");
			assert!(gate.is_due(&"a", t0));
			gate.retain(|k| *k != "b");
			assert!(gate.is_empty());
		}
	}
}

pub mod bind {
	use std::net::SocketAddr;

	/// Parsed `host:port` listener address (an optional `http://` prefix is accepted).
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct ListenAddr {
		pub host: String,
		pub port: u16,
	}

	impl ListenAddr {
		/// Returns `host:port` (IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr`; the host must be an IP literal.
		pub fn to_socket_addr(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("listen address must be non-empty (expected host:port)".to_string());
			}

			let rest = s.strip_prefix("http://").unwrap_or(s);
			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid listen address (expected host:port without path): {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid listen address (missing :port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid listen address host: {s}"));
			}
			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("invalid listen address (IPv6 must be bracketed like [::1]:9000): {s}"));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid listen port (expected 1..=65535): {s}"))?;
			if port == 0 {
				return Err(format!("invalid listen port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	/// Parse straight to a `SocketAddr`.
	pub fn parse_socket_addr(s: &str) -> Result<SocketAddr, String> {
		ListenAddr::parse(s)?.to_socket_addr()
	}

}

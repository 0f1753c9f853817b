#![forbid(unsafe_code)]

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{CastEvent, Store};

/// In-memory event queue shared by a client's read loop and flush loop.
#[derive(Debug, Default)]
pub struct EventBuffer {
	events: Mutex<Vec<CastEvent>>,
}

impl EventBuffer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&self, event: CastEvent) {
		self.events.lock().push(event);
	}

	pub fn len(&self) -> usize {
		self.events.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.events.lock().is_empty()
	}

	/// Swap the buffer for an empty one.
	pub fn take(&self) -> Vec<CastEvent> {
		std::mem::take(&mut *self.events.lock())
	}

	/// Put unpersisted events back ahead of anything appended since `take`.
	pub fn requeue_front(&self, mut failed: Vec<CastEvent>) {
		if failed.is_empty() {
			return;
		}
		let mut guard = self.events.lock();
		failed.append(&mut *guard);
		*guard = failed;
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
	/// Events swapped out of the buffer.
	pub taken: usize,

	/// Events in chunks the store accepted.
	pub persisted: usize,

	/// Rows the store reported as new (duplicates are ignored store-side).
	pub inserted: u64,

	/// Events put back for the next flush.
	pub requeued: usize,
}

/// Swap the buffer out and persist it in chunks of `chunk_size`.
///
/// The first failing chunk and every chunk after it are requeued at the
/// front of the buffer; chunks already accepted are not.
pub async fn flush(buffer: &EventBuffer, store: &dyn Store, chunk_size: usize) -> FlushOutcome {
	let batch = buffer.take();
	let mut outcome = FlushOutcome {
		taken: batch.len(),
		..FlushOutcome::default()
	};
	if batch.is_empty() {
		return outcome;
	}

	let chunk_size = chunk_size.max(1);
	let mut offset = 0;
	while offset < batch.len() {
		let end = (offset + chunk_size).min(batch.len());
		match store.insert_events_batch(&batch[offset..end]).await {
			Ok(inserted) => {
				outcome.persisted += end - offset;
				outcome.inserted += inserted;
				offset = end;
			}
			Err(e) => {
				warn!(error = %e, failed = batch.len() - offset, "event flush failed; requeueing");
				metrics::counter!("castwatch_flushes_total", "outcome" => "failed").increment(1);
				let mut rest = batch;
				let failed = rest.split_off(offset);
				outcome.requeued = failed.len();
				buffer.requeue_front(failed);
				return outcome;
			}
		}
	}

	metrics::counter!("castwatch_flushes_total", "outcome" => "ok").increment(1);
	metrics::counter!("castwatch_events_persisted_total").increment(outcome.inserted);
	debug!(taken = outcome.taken, inserted = outcome.inserted, "event flush ok");
	outcome
}

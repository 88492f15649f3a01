//! Cancellation registry for in-flight operations.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mcp::rpc::RequestId;

struct Entry {
    token: CancellationToken,
    generation: u64,
}

/// Maps operation ids to the token that aborts them.
#[derive(Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<RequestId, Entry>>,
    generation: AtomicU64,
}

/// Removes its registration when dropped, unless the entry was already cancelled,
/// untracked, or replaced by a newer registration under the same id.
#[must_use = "dropping the guard untracks the operation immediately"]
pub struct TrackGuard {
    registry: Arc<CancellationRegistry>,
    id: RequestId,
    generation: u64,
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        let mut entries = self.registry.entries.lock();
        if entries
            .get(&self.id)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            entries.remove(&self.id);
        }
    }
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a child of `parent` and records it under `id`, overwriting any
    /// previous entry for the same id.
    pub fn track(
        self: &Arc<Self>,
        parent: &CancellationToken,
        id: RequestId,
    ) -> (CancellationToken, TrackGuard) {
        let token = parent.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.entries.lock().insert(
            id.clone(),
            Entry {
                token: token.clone(),
                generation,
            },
        );
        if previous.is_some() {
            debug!(request_id = %id, "replaced cancellation entry for reused id");
        }

        let guard = TrackGuard {
            registry: Arc::clone(self),
            id,
            generation,
        };
        (token, guard)
    }

    /// Cancels and forgets the operation. Returns whether it was still tracked.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let entry = self.entries.lock().remove(id);
        match entry {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forgets the operation without cancelling it.
    pub fn untrack(&self, id: &RequestId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.token.cancel();
        }
        drained.len()
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().len()
    }
}

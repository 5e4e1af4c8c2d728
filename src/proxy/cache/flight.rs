use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

/// Per-key coordination for origin fetches.
///
/// `lease` hands out a shared async mutex for the key; whichever caller locks
/// it first becomes the fetch leader for that key. Holders of the same key
/// share one mutex, so N concurrent misses serialize on a single token while
/// fetches for unrelated keys proceed untouched. The map holds only weak
/// references; once every holder drops its lease the slot disappears, so a
/// failed fetch leaves no residue and a later request starts fresh.
#[derive(Debug, Default)]
pub(super) struct FlightGroup {
    inflight: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl FlightGroup {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn lease(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut guard = self.inflight.lock();
        guard.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = guard.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let fresh = Arc::new(AsyncMutex::new(()));
        guard.insert(key.to_string(), Arc::downgrade(&fresh));
        fresh
    }

    #[cfg(test)]
    fn live_keys(&self) -> usize {
        let mut guard = self.inflight.lock();
        guard.retain(|_, weak| weak.strong_count() > 0);
        guard.len()
    }
}

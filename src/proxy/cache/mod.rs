use std::future::Future;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use http::StatusCode;
use parking_lot::Mutex;
use tokio::{fs as async_fs, task};
use tracing::{trace, warn};

mod entry;
mod flight;
mod index;
mod key;
mod maintenance;
mod store;

use entry::{CacheEntry, PersistedEntry};
use flight::FlightGroup;
use index::CacheIndex;
pub(crate) use key::CacheKey;
use maintenance::spawn_cache_sweeper;
use store::CacheStore;

use crate::proxy::http::origin::{FetchError, OriginResponse};

/// A committed cache record: the complete response bytes live at `body_path`
/// exactly as received from the origin.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub body_path: PathBuf,
    pub content_length: u64,
}

/// What happened to a freshly fetched response on the cache side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Stored,
    Skipped(&'static str),
    Failed,
}

impl StoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStatus::Stored => "stored",
            StoreStatus::Skipped(reason) => reason,
            StoreStatus::Failed => "failed",
        }
    }
}

#[derive(Debug)]
pub enum CacheOutcome {
    Hit(CachedResponse),
    Fetched {
        response: OriginResponse,
        store: StoreStatus,
    },
}

#[derive(Clone)]
pub struct HttpCache {
    state: Arc<CacheState>,
}

#[derive(Debug)]
struct CacheState {
    index: Mutex<CacheIndex>,
    store: CacheStore,
    flights: FlightGroup,
    max_entry_size: u64,
    max_bytes: u64,
    ttl: Option<Duration>,
    next_id: AtomicU64,
}

#[derive(Debug, Default)]
struct SweepStats {
    inspected: usize,
    removed: u64,
    bytes_reclaimed: u64,
}

impl HttpCache {
    pub async fn new(
        capacity: usize,
        disk_dir: PathBuf,
        max_entry_size: u64,
        max_bytes: u64,
        ttl: Option<Duration>,
        sweeper_interval: Duration,
        sweeper_batch_size: usize,
    ) -> Result<Self> {
        async_fs::create_dir_all(&disk_dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", disk_dir.display()))?;

        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| anyhow!("cache capacity must be greater than zero"))?;
        let index = CacheIndex::new(capacity, max_bytes);
        let store = CacheStore::new(disk_dir);
        let state = Arc::new(CacheState {
            index: Mutex::new(index),
            store,
            flights: FlightGroup::new(),
            max_entry_size,
            max_bytes,
            ttl,
            next_id: AtomicU64::new(1),
        });

        let rebuild = {
            let state = state.clone();
            task::spawn_blocking(move || state.rebuild_from_disk())
        };
        rebuild
            .await
            .map_err(|err| anyhow!("cache rebuild task failed: {err}"))??;

        if ttl.is_some() {
            spawn_cache_sweeper(state.clone(), sweeper_interval, sweeper_batch_size);
        }
        Ok(Self { state })
    }

    /// Non-blocking lookup: returns the committed entry for the key if it is
    /// present, unexpired, and its body is still on disk.
    pub(crate) async fn lookup(&self, key: &CacheKey) -> Option<CachedResponse> {
        let result = self.lookup_entry(key).await;
        crate::metrics::record_cache_lookup(result.is_some());
        result
    }

    async fn lookup_entry(&self, key: &CacheKey) -> Option<CachedResponse> {
        let entry = {
            let mut guard = self.state.index.lock();
            guard.get(key.key_base())
        }?;

        if entry.is_expired(SystemTime::now()) {
            trace!("cache entry expired");
            if self
                .state
                .remove_entry_if_id_matches(key.key_base(), entry.id)
            {
                self.state
                    .store
                    .remove_entry_files_async(&entry.entry_id)
                    .await;
            }
            return None;
        }

        let body_path = self.state.store.body_path(&entry.entry_id);
        if let Err(err) = async_fs::metadata(&body_path).await {
            warn!(
                error = %err,
                path = %body_path.display(),
                "cache body missing on disk"
            );
            if self
                .state
                .remove_entry_if_id_matches(key.key_base(), entry.id)
            {
                self.state
                    .store
                    .remove_entry_files_async(&entry.entry_id)
                    .await;
            }
            return None;
        }

        Some(CachedResponse {
            status: entry.status,
            body_path,
            content_length: entry.content_length,
        })
    }

    /// Return the committed entry for the key, or run `fetch` under the
    /// per-key in-flight token and commit its result.
    ///
    /// Concurrent misses for the same key serialize on the token; after a
    /// successful leader every waiter observes the committed entry on its
    /// re-check, so the origin is contacted exactly once. A failed fetch
    /// commits nothing and releases the token, leaving retries to later
    /// requests. The token is never held across client-facing I/O.
    pub(crate) async fn fetch_or_store<F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
    ) -> Result<CacheOutcome, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<OriginResponse, FetchError>>,
    {
        if let Some(hit) = self.lookup(key).await {
            return Ok(CacheOutcome::Hit(hit));
        }

        let lease = self.state.flights.lease(key.entry_id());
        let _token = lease.lock().await;

        // A concurrent leader may have committed while we waited for the token.
        if let Some(hit) = self.lookup_entry(key).await {
            return Ok(CacheOutcome::Hit(hit));
        }

        let response = fetch().await?;
        let store = self.commit(key, &response).await;
        Ok(CacheOutcome::Fetched { response, store })
    }

    /// Commit a fetched response. Failures are contained here: the response is
    /// still relayed to the client, the cache just ends up without an entry.
    async fn commit(&self, key: &CacheKey, response: &OriginResponse) -> StoreStatus {
        let size = response.bytes.len() as u64;
        if size > self.state.max_entry_size {
            trace!(size, "response exceeds cache entry size limit");
            return StoreStatus::Skipped("entry_too_large");
        }
        if size > self.state.max_bytes {
            return StoreStatus::Skipped("exceeds_capacity");
        }

        let temp_name = format!("tmp_{}", uuid::Uuid::new_v4());
        if let Err(err) = self
            .state
            .store
            .publish_body(key.entry_id(), &temp_name, &response.bytes)
            .await
        {
            warn!(error = %err, "failed to publish cache entry body");
            crate::metrics::record_cache_store_failure();
            return StoreStatus::Failed;
        }

        let entry = CacheEntry {
            id: self.state.next_entry_id(),
            entry_id: key.entry_id().to_string(),
            status: response.status,
            expires_at: self.state.ttl.map(|ttl| SystemTime::now() + ttl),
            content_hash: blake3::hash(&response.bytes).to_hex().to_string(),
            content_length: size,
        };
        let persisted = entry.to_persisted(key.key_base());

        if let Err(err) = self
            .state
            .store
            .write_metadata_async(key.entry_id(), &persisted)
            .await
        {
            warn!(error = %err, "failed to write cache metadata");
            self.state.store.remove_entry_files_async(key.entry_id()).await;
            crate::metrics::record_cache_store_failure();
            return StoreStatus::Failed;
        }

        let evicted = self
            .state
            .insert_entry(key.key_base().to_string(), entry);
        trace!("stored cache entry for {}", key.key_base());
        crate::metrics::record_cache_store();
        crate::metrics::set_cache_entries(self.state.index.lock().len());

        self.state.remove_evicted_files_async(evicted).await;
        StoreStatus::Stored
    }
}

impl CacheState {
    fn next_entry_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn remove_entry_if_id_matches(&self, key_base: &str, entry_id: u64) -> bool {
        let mut guard = self.index.lock();
        guard.remove_if_id_matches(key_base, entry_id).is_some()
    }

    fn insert_entry(&self, key_base: String, entry: CacheEntry) -> Vec<CacheEntry> {
        let mut guard = self.index.lock();
        guard.insert(key_base, entry)
    }

    async fn remove_evicted_files_async(&self, evicted: Vec<CacheEntry>) {
        if evicted.is_empty() {
            return;
        }
        crate::metrics::record_cache_evictions(evicted.len() as u64);
        for entry in evicted {
            self.store.remove_entry_files_async(&entry.entry_id).await;
        }
    }
}

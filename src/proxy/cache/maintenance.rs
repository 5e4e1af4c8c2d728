use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tracing::{debug, trace, warn};

use super::{CacheEntry, CacheState, PersistedEntry, SweepStats};

pub(super) fn spawn_cache_sweeper(state: Arc<CacheState>, interval: Duration, batch_size: usize) {
    if interval.is_zero() || batch_size == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.sweep_expired_entries(batch_size).await {
                Ok(stats) => {
                    if stats.removed > 0 {
                        debug!(
                            inspected = stats.inspected,
                            removed = stats.removed,
                            bytes_reclaimed = stats.bytes_reclaimed,
                            "cache sweep reclaimed expired entries"
                        );
                    }
                }
                Err(err) => {
                    warn!(error = %err, "cache sweep failed");
                }
            }
        }
    });
}

impl CacheState {
    /// Rebuild the in-memory index from the persisted layout. Orphaned temp
    /// files, unreadable metadata, expired entries, and bodies whose content
    /// hash no longer matches are all removed rather than resurrected.
    pub(super) fn rebuild_from_disk(&self) -> Result<()> {
        self.store.remove_temp_files()?;
        {
            let mut guard = self.index.lock();
            guard.reset();
        }

        if !self.store.disk_dir().exists() {
            return Ok(());
        }

        let mut restored = 0usize;
        for shard1 in fs::read_dir(self.store.disk_dir())? {
            let shard1 = shard1?;
            if !shard1.file_type()?.is_dir() {
                continue;
            }
            for shard2 in fs::read_dir(shard1.path())? {
                let shard2 = shard2?;
                if !shard2.file_type()?.is_dir() {
                    continue;
                }
                let mut meta_files = Vec::new();
                let mut body_files = Vec::new();
                for file in fs::read_dir(shard2.path())? {
                    let file = file?;
                    let path = file.path();
                    if !file.file_type()?.is_file() {
                        continue;
                    }
                    if path.extension().and_then(|ext| ext.to_str()) == Some("meta") {
                        meta_files.push(path);
                    } else {
                        body_files.push(path);
                    }
                }

                for meta_path in meta_files {
                    match self.restore_entry(&meta_path) {
                        Ok(true) => restored += 1,
                        Ok(false) => {}
                        Err(err) => {
                            warn!(
                                error = %err,
                                path = %meta_path.display(),
                                "failed to restore cache entry"
                            );
                            self.store.remove_entry_files_from_meta(&meta_path);
                        }
                    }
                }

                // A body without metadata is an interrupted commit; drop it.
                for body_path in body_files {
                    let has_meta = body_path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .filter(|entry_id| entry_id.len() >= 4)
                        .map(|entry_id| self.store.meta_path(entry_id).exists())
                        .unwrap_or(false);
                    if !has_meta {
                        fs::remove_file(&body_path).ok();
                    }
                }
            }
        }

        debug!(restored, "cache index rebuilt from disk");
        crate::metrics::set_cache_entries(restored);
        Ok(())
    }

    /// Restore one entry from its metadata file. Returns Ok(false) when the
    /// entry was invalid and its files were removed.
    fn restore_entry(&self, meta_path: &std::path::Path) -> Result<bool> {
        let data = fs::read(meta_path)?;
        let persisted: PersistedEntry = match serde_json::from_slice(&data) {
            Ok(persisted) => persisted,
            Err(err) => {
                trace!(error = %err, path = %meta_path.display(), "unreadable cache metadata");
                self.store.remove_entry_files_from_meta(meta_path);
                return Ok(false);
            }
        };

        let entry_id = meta_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();
        if entry_id.len() < 4 {
            self.store.remove_entry_files_from_meta(meta_path);
            return Ok(false);
        }

        let entry = CacheEntry::from_persisted(&persisted, &entry_id, self.next_entry_id());
        if entry.is_expired(SystemTime::now()) {
            trace!(key = %persisted.key_base, "pruning expired cache entry during rebuild");
            self.store.remove_entry_files_from_meta(meta_path);
            return Ok(false);
        }

        let body_path = self.store.body_path(&entry_id);
        if !body_path.exists() {
            self.store.remove_entry_files_from_meta(meta_path);
            return Ok(false);
        }
        if !self
            .store
            .content_hash_matches(&body_path, &entry.content_hash)
        {
            trace!(key = %persisted.key_base, "pruning cache entry with mismatched content hash");
            self.store.remove_entry_files_from_meta(meta_path);
            return Ok(false);
        }

        let evicted = {
            let mut guard = self.index.lock();
            guard.insert(persisted.key_base.clone(), entry)
        };
        for evicted_entry in evicted {
            let meta = self.store.meta_path(&evicted_entry.entry_id);
            self.store.remove_entry_files_from_meta(&meta);
        }
        Ok(true)
    }

    /// Remove up to `batch_size` expired entries, reclaiming their files.
    pub(super) async fn sweep_expired_entries(&self, batch_size: usize) -> Result<SweepStats> {
        let now = SystemTime::now();
        let snapshot = {
            let guard = self.index.lock();
            guard.iter_snapshot()
        };

        let mut stats = SweepStats::default();
        for (key_base, entry) in snapshot.into_iter().take(batch_size) {
            stats.inspected += 1;
            if !entry.is_expired(now) {
                continue;
            }
            if self.remove_entry_if_id_matches(&key_base, entry.id) {
                self.store.remove_entry_files_async(&entry.entry_id).await;
                stats.removed += 1;
                stats.bytes_reclaimed += entry.content_length;
            }
        }
        if stats.removed > 0 {
            crate::metrics::set_cache_entries(self.index.lock().len());
        }
        Ok(stats)
    }
}

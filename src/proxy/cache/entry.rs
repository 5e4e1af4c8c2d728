use std::time::SystemTime;

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// In-memory index record for a committed cache entry. The response bytes
/// themselves live on disk under the entry id; this record is immutable once
/// inserted and replaced wholesale on update.
#[derive(Debug, Clone)]
pub(super) struct CacheEntry {
    pub id: u64,
    pub entry_id: String,
    pub status: StatusCode,
    pub expires_at: Option<SystemTime>,
    pub content_hash: String,
    pub content_length: u64,
}

/// On-disk metadata sidecar, serialized as JSON next to the body file.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct PersistedEntry {
    pub key_base: String,
    pub status: u16,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub content_hash: String,
    pub content_length: u64,
}

impl CacheEntry {
    pub(super) fn is_expired(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }

    pub(super) fn to_persisted(&self, key_base: &str) -> PersistedEntry {
        PersistedEntry {
            key_base: key_base.to_string(),
            status: self.status.as_u16(),
            created_at: unix_seconds(SystemTime::now()),
            expires_at: self.expires_at.map(unix_seconds),
            content_hash: self.content_hash.clone(),
            content_length: self.content_length,
        }
    }

    pub(super) fn from_persisted(persisted: &PersistedEntry, entry_id: &str, id: u64) -> Self {
        Self {
            id,
            entry_id: entry_id.to_string(),
            status: StatusCode::from_u16(persisted.status).unwrap_or(StatusCode::OK),
            expires_at: persisted
                .expires_at
                .map(|secs| SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs)),
            content_hash: persisted.content_hash.clone(),
            content_length: persisted.content_length,
        }
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

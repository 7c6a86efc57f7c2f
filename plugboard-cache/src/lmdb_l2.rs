//! LMDB-backed shared tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) so a fleet of processes on
//! one host shares a memory-mapped L2. Records are stored as
//! `[timestamp: 8 bytes][payload]`, keys as the fixed-width
//! [`CacheKey`] encoding.
//!
//! LMDB provides ACID transactions: reads use read transactions, mutations
//! use short-lived write transactions committed per call.

use crate::key::CacheKey;
use crate::traits::{CacheStats, SharedTier, TierRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use plugboard_core::{CacheError, Timestamp};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

fn backend_err(e: impl std::fmt::Display) -> CacheError {
    CacheError::Backend {
        reason: e.to_string(),
    }
}

/// LMDB-backed [`SharedTier`].
pub struct LmdbTier {
    env: Env,
    db: Database<Bytes, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LmdbTier {
    /// Open (or create) an LMDB environment at `path`, bounded to
    /// `max_size_mb` megabytes.
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&path).map_err(backend_err)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(backend_err)?;

        let mut wtxn = env.write_txn().map_err(backend_err)?;
        let db: Database<Bytes, Bytes> =
            env.create_database(&mut wtxn, None).map_err(backend_err)?;
        wtxn.commit().map_err(backend_err)?;

        Ok(Self {
            env,
            db,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn decode_record(bytes: &[u8]) -> Result<TierRecord, CacheError> {
        if bytes.len() < 8 {
            return Err(CacheError::Serialization {
                reason: "record shorter than timestamp header".into(),
            });
        }
        let timestamp_bytes: [u8; 8] =
            bytes[0..8].try_into().map_err(|_| CacheError::Serialization {
                reason: "invalid timestamp header".into(),
            })?;
        let millis = i64::from_le_bytes(timestamp_bytes);
        let cached_at = DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now);
        Ok(TierRecord {
            payload: bytes[8..].to_vec(),
            cached_at,
        })
    }

    fn encode_record(payload: &[u8], cached_at: Timestamp) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + payload.len());
        bytes.extend_from_slice(&cached_at.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }
}

#[async_trait]
impl SharedTier for LmdbTier {
    async fn get(&self, key: &CacheKey) -> Result<Option<TierRecord>, CacheError> {
        let encoded = key.encode();
        let rtxn = self.env.read_txn().map_err(backend_err)?;
        match self.db.get(&rtxn, &encoded).map_err(backend_err)? {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(Self::decode_record(bytes)?))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(
        &self,
        key: &CacheKey,
        payload: &[u8],
        cached_at: Timestamp,
    ) -> Result<(), CacheError> {
        let encoded = key.encode();
        let record = Self::encode_record(payload, cached_at);
        let mut wtxn = self.env.write_txn().map_err(backend_err)?;
        self.db
            .put(&mut wtxn, &encoded, &record)
            .map_err(backend_err)?;
        wtxn.commit().map_err(backend_err)
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        let encoded = key.encode();
        let mut wtxn = self.env.write_txn().map_err(backend_err)?;
        self.db.delete(&mut wtxn, &encoded).map_err(backend_err)?;
        wtxn.commit().map_err(backend_err)
    }

    async fn clear(&self) -> Result<u64, CacheError> {
        let mut wtxn = self.env.write_txn().map_err(backend_err)?;
        let removed = self.db.len(&wtxn).map_err(backend_err)?;
        self.db.clear(&mut wtxn).map_err(backend_err)?;
        wtxn.commit().map_err(backend_err)?;
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let rtxn = self.env.read_txn().map_err(backend_err)?;
        let entry_count = self.db.len(&rtxn).map_err(backend_err)?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            evictions: 0, // LMDB does not evict; the map size bounds it.
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tier() -> (tempfile::TempDir, LmdbTier) {
        let dir = tempfile::tempdir().expect("tempdir");
        let tier = LmdbTier::new(dir.path(), 16).expect("open lmdb");
        (dir, tier)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, tier) = tier();
        let key = CacheKey::Entity(Uuid::now_v7());
        let cached_at = Utc::now();
        tier.put(&key, b"payload", cached_at).await.unwrap();

        let record = tier.get(&key).await.unwrap().unwrap();
        assert_eq!(record.payload, b"payload");
        assert_eq!(
            record.cached_at.timestamp_millis(),
            cached_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_miss_and_remove() {
        let (_dir, tier) = tier();
        let key = CacheKey::derived("absent");
        assert!(tier.get(&key).await.unwrap().is_none());

        tier.put(&key, b"v", Utc::now()).await.unwrap();
        tier.remove(&key).await.unwrap();
        assert!(tier.get(&key).await.unwrap().is_none());
        // Removing again is a no-op.
        tier.remove(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let (_dir, tier) = tier();
        let now = Utc::now();
        for n in 0..3 {
            tier.put(&CacheKey::derived(format!("k{n}")), b"v", now)
                .await
                .unwrap();
        }
        assert_eq!(tier.stats().await.unwrap().entry_count, 3);
        assert_eq!(tier.clear().await.unwrap(), 3);
        assert_eq!(tier.stats().await.unwrap().entry_count, 0);
    }
}

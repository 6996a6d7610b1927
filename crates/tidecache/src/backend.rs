//! Shared Redis tier.
//!
//! Sits between the mem tier and the loader: fetches promote into the mem
//! tier, loads run under a per-key write lock so a herd of cold readers
//! executes the loader once per process, and every successful load writes
//! Redis before the mem tier so a crash between the two cannot leave the
//! mem tier ahead of the shared store.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use tidecache_core::{Entry, MemCache, TierSnapshot, TierStats};

use crate::error::{BoxError, CacheError};

type KeyLock = Arc<RwLock<()>>;

/// Redis-backed cache tier with per-key read/write locking.
pub(crate) struct RedisTier {
    pool: Pool,
    /// One RW lock per key, installed on first access and reclaimed after
    /// a load once no other task holds it.
    locks: DashMap<String, KeyLock>,
    mem: Arc<MemCache>,
    stats: TierStats,
}

impl RedisTier {
    pub(crate) fn new(name: &str, pool: Pool, mem: Arc<MemCache>) -> Self {
        Self {
            pool,
            locks: DashMap::new(),
            mem,
            stats: TierStats::new(name, "redis"),
        }
    }

    fn key_lock(&self, key: &str) -> KeyLock {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    pub(crate) fn stats(&self) -> TierSnapshot {
        self.stats.snapshot()
    }

    /// Fetches the entry for `key`, promoting it into the mem tier.
    ///
    /// Transport and decode failures degrade to a miss so the resolver can
    /// fall through to the loader.
    pub(crate) async fn get(&self, key: &str) -> Option<Entry> {
        let lock = self.key_lock(key);
        let _guard = lock.read().await;

        // Readers stacked behind a write-lock holder see the entry it just
        // published, without another round-trip.
        if let Some((entry, true)) = self.mem.load(key) {
            self.stats.record_hit();
            return Some(entry);
        }

        let entry = match self.fetch_entry(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.stats.record_miss();
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "redis read failed, treating as miss");
                self.stats.record_miss();
                return None;
            }
        };

        // Redis expiry normally beats the envelope's own expiration, but a
        // skewed writer clock must not let a dead entry through.
        if entry.expired() {
            self.stats.record_miss();
            return None;
        }

        self.stats.record_hit();
        self.mem.set(key, entry.clone());
        Some(entry)
    }

    async fn fetch_entry(&self, key: &str) -> Result<Option<Entry>, CacheError> {
        let mut conn = self.pool.get().await?;
        let payload: Option<String> = conn.get(key).await?;
        let payload = match payload {
            Some(payload) if !payload.is_empty() => payload,
            _ => return Ok(None),
        };
        let entry = serde_json::from_str(&payload).map_err(CacheError::Decode)?;
        Ok(Some(entry))
    }

    /// Runs the loader under the per-key write lock and publishes the
    /// result to Redis, then to the mem tier.
    ///
    /// A writer that lost the lock race finds a fresh mem entry on the
    /// re-check and returns it without invoking its loader.
    pub(crate) async fn load<T, F, Fut>(&self, key: &str, ttl_secs: u64, loader: F) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let lock = self.key_lock(key);
        let result = self.load_locked(&lock, key, ttl_secs, loader).await;
        drop(lock);

        // Reclaim the per-key lock unless another task holds a clone; a
        // racing reader either kept the count above one or installs a new
        // lock afterwards.
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn load_locked<T, F, Fut>(
        &self,
        lock: &KeyLock,
        key: &str,
        ttl_secs: u64,
        loader: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let _guard = lock.write().await;

        if let Some((entry, true)) = self.mem.load(key) {
            return entry.object().map_err(CacheError::Copy);
        }

        let value = loader().await.map_err(CacheError::Loader)?;

        let entry = Entry::new(&value, ttl_secs).map_err(CacheError::Copy)?;
        let payload = serde_json::to_string(&entry).map_err(CacheError::Copy)?;

        // Redis first; on failure the mem tier stays untouched.
        self.set(key, &payload, entry.remaining_ttl_secs()).await?;
        self.mem.set(key, entry);

        debug!(key = %key, ttl_secs, "loaded and published");
        Ok(value)
    }

    pub(crate) async fn set(&self, key: &str, payload: &str, ttl_secs: u64) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        conn.set_ex::<_, _, ()>(key, payload, ttl_secs.max(1)).await?;
        Ok(())
    }

    /// Removes every key matching the glob `pattern` from Redis.
    pub(crate) async fn delete(&self, pattern: &str) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if keys.is_empty() {
            return Ok(());
        }

        debug!(pattern = %pattern, count = keys.len(), "deleting redis keys");
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }
}

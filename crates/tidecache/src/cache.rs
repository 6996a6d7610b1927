//! Read-through resolver over the two tiers.
//!
//! ## Resolution order
//!
//! ```text
//! get_object → mem tier → redis tier → loader
//!                  │           │
//!            soft-stale?  soft-stale?
//!                  │           │
//!                  └── background refresh (per-key write lock coalesces)
//! ```
//!
//! Soft-stale hits return the stale value immediately and dispatch the
//! refresh in the background, so latency stays flat during reloads.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use tidecache_core::stats::names;
use tidecache_core::{MemCache, TierSnapshot};

use crate::backend::RedisTier;
use crate::config::CacheConfig;
use crate::error::{BoxError, CacheError};
use crate::pubsub::{self, InvalidationListener};

const DEBUG_TTL_SECS: u64 = 1;
const DEBUG_CLEAN_INTERVAL: Duration = Duration::from_secs(1);

/// Two-tier read-through cache handle. Cheap to clone; all clones share
/// the same tiers.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    name: String,
    mem: Arc<MemCache>,
    redis: Arc<RedisTier>,
    pool: deadpool_redis::Pool,
    /// Forces TTL and the sweep interval down to one second.
    debug: AtomicBool,
    listener: tokio::task::JoinHandle<()>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Point-in-time counters for both tiers.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub mem: TierSnapshot,
    pub mem_entries: usize,
    pub redis: TierSnapshot,
}

impl Cache {
    /// Connects to Redis at `addr` (`host:port` or a `redis://` URL) and
    /// spawns the invalidation subscriber and the mem-tier sweeper.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        password: impl Into<String>,
        max_connections: usize,
    ) -> Result<Self, CacheError> {
        let config = CacheConfig::new(name, addr)
            .with_password(password)
            .with_pool_size(max_connections);
        Self::with_config(config)
    }

    pub fn with_config(config: CacheConfig) -> Result<Self, CacheError> {
        let pool = config.create_pool()?;
        let mem = Arc::new(MemCache::new(&config.name, config.clean_interval()));
        let redis = Arc::new(RedisTier::new(&config.name, pool.clone(), Arc::clone(&mem)));

        let listener = InvalidationListener {
            redis_url: config.redis_url(),
            mem: Arc::clone(&mem),
            redis: Arc::clone(&redis),
        };
        let listener = tokio::spawn(listener.run());

        Ok(Self {
            inner: Arc::new(CacheInner {
                name: config.name,
                mem,
                redis,
                pool,
                debug: AtomicBool::new(false),
                listener,
            }),
        })
    }

    /// Resolves `key` through mem tier, Redis tier, and finally `loader`.
    ///
    /// The returned value is always materialized fresh from the cached
    /// payload (or is the loader's own result) — mutating it never affects
    /// cache state. A soft-stale hit returns the stale value and refreshes
    /// in the background; per-key write locking keeps the loader to one
    /// concurrent run per process.
    pub async fn get_object<T, F, Fut>(
        &self,
        key: &str,
        ttl_secs: u64,
        loader: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let ttl = if self.inner.debug.load(Ordering::Relaxed) {
            DEBUG_TTL_SECS
        } else {
            ttl_secs
        };

        if let Some(entry) = self.inner.mem.get(key) {
            if entry.outdated() {
                debug!(key = %key, "mem entry soft-stale, refreshing");
                let inner = Arc::clone(&self.inner);
                let key = key.to_string();
                tokio::spawn(async move {
                    inner.sync_mem::<T, _, _>(&key, ttl, loader).await;
                });
            }
            return entry.object().map_err(CacheError::Copy);
        }

        match self.inner.redis.get(key).await {
            Some(entry) => {
                if entry.outdated() {
                    debug!(key = %key, "redis entry soft-stale, refreshing");
                    let inner = Arc::clone(&self.inner);
                    let key = key.to_string();
                    tokio::spawn(async move {
                        inner.refresh::<T, _, _>(&key, ttl, loader).await;
                    });
                }
                entry.object().map_err(CacheError::Copy)
            }
            None => self.inner.redis.load(key, ttl, loader).await,
        }
    }

    /// Deletes `key` on every node by publishing on the invalidation
    /// channel. The local node applies the deletion through its own
    /// subscription like any other peer.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        pubsub::publish_delete(&self.inner.pool, key).await
    }

    /// Debug mode: every TTL becomes one second and the sweeper runs every
    /// second.
    pub fn enable_debug(&self) {
        self.inner.debug.store(true, Ordering::Relaxed);
        self.inner.mem.stop_scan();
        self.inner.mem.set_clean_interval(DEBUG_CLEAN_INTERVAL);
        self.inner.mem.start_scan();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            mem: self.inner.mem.stats(),
            mem_entries: self.inner.mem.len(),
            redis: self.inner.redis.stats(),
        }
    }
}

impl CacheInner {
    /// Heals the mem tier after a soft-stale mem hit. Whichever node
    /// refreshed the shared tier heals every other node's mem tier through
    /// this re-read.
    async fn sync_mem<T, F, Fut>(&self, key: &str, ttl_secs: u64, loader: F)
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        match self.redis.get(key).await {
            // The get already promoted the fresh entry into the mem tier.
            Some(entry) if !entry.outdated() => {}
            _ => self.refresh::<T, _, _>(key, ttl_secs, loader).await,
        }
    }

    /// Fire-and-forget reload; there is no caller to report to, so
    /// failures are logged and counted.
    async fn refresh<T, F, Fut>(&self, key: &str, ttl_secs: u64, loader: F)
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        if let Err(e) = self.redis.load::<T, _, _>(key, ttl_secs, loader).await {
            warn!(cache = %self.name, key = %key, error = %e, "background refresh failed");
            counter!(names::CACHE_REFRESH_FAILURES_TOTAL, "cache" => self.name.clone()).increment(1);
        }
    }
}

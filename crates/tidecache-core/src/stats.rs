//! Per-tier query/hit accounting.
//!
//! Counters are kept twice: as atomics for the in-process snapshot API and
//! as [`metrics`] facade counters so a host application that installs a
//! recorder gets them for free. Periodic reporting is the host's business.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;

/// Metric names emitted by the cache.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_REFRESH_FAILURES_TOTAL: &str = "cache_refresh_failures_total";
}

/// Query and hit counters for one tier of one named cache.
#[derive(Debug)]
pub struct TierStats {
    cache: String,
    tier: &'static str,
    queries: AtomicU64,
    hits: AtomicU64,
}

impl TierStats {
    pub fn new(cache: impl Into<String>, tier: &'static str) -> Self {
        Self {
            cache: cache.into(),
            tier,
            queries: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn record_hit(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(
            names::CACHE_HITS_TOTAL,
            "cache" => self.cache.clone(),
            "tier" => self.tier
        )
        .increment(1);
    }

    pub fn record_miss(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        counter!(
            names::CACHE_MISSES_TOTAL,
            "cache" => self.cache.clone(),
            "tier" => self.tier
        )
        .increment(1);
    }

    pub fn snapshot(&self) -> TierSnapshot {
        TierSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a tier's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSnapshot {
    pub queries: u64,
    pub hits: u64,
}

impl TierSnapshot {
    /// Hit rate in `[0, 1]`; zero queries count as zero.
    pub fn hit_rate(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.hits as f64 / self.queries as f64
        }
    }
}

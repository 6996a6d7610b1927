//! Process-local cache tier.
//!
//! A concurrent map from key to [`Entry`] with a background sweeper that
//! drops hard-expired entries. Soft-stale entries are left in place; they
//! stay serveable until hard expiry and are replaced by refreshes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::debug;

use crate::entry::Entry;
use crate::stats::{TierSnapshot, TierStats};

/// Default interval between sweeps of the mem tier.
pub const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(10);

/// In-memory cache tier.
pub struct MemCache {
    items: Arc<DashMap<String, Entry>>,
    clean_interval: Mutex<Duration>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stats: TierStats,
}

impl MemCache {
    /// Creates the tier and starts its sweeper.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(name: &str, clean_interval: Duration) -> Self {
        let cache = Self {
            items: Arc::new(DashMap::new()),
            clean_interval: Mutex::new(clean_interval),
            sweeper: Mutex::new(None),
            stats: TierStats::new(name, "mem"),
        };
        cache.start_scan();
        cache
    }

    /// Atomically replaces the entry for `key`.
    pub fn set(&self, key: &str, entry: Entry) {
        debug!(key = %key, "mem tier updated");
        self.items.insert(key.to_string(), entry);
    }

    /// Returns the live entry for `key`. Hard-expired entries read as
    /// absent and are dropped on the way out.
    pub fn get(&self, key: &str) -> Option<Entry> {
        let entry = match self.items.get(key) {
            Some(entry) => entry.clone(),
            None => {
                self.stats.record_miss();
                return None;
            }
        };

        if entry.expired() {
            // Re-check under the shard lock: a writer may have replaced
            // the entry since the read above.
            self.items.remove_if(key, |_, e| e.expired());
            self.stats.record_miss();
            return None;
        }

        self.stats.record_hit();
        Some(entry)
    }

    /// Like [`get`](Self::get), paired with a freshness flag:
    /// `true` only when the entry exists and is not yet soft-stale.
    ///
    /// The resolver uses this to double-check after acquiring the per-key
    /// lock.
    pub fn load(&self, key: &str) -> Option<(Entry, bool)> {
        let entry = self.get(key)?;
        let fresh = !entry.outdated();
        Some((entry, fresh))
    }

    /// Removes the mapping; no-op if absent.
    pub fn delete(&self, key: &str) {
        self.items.remove(key);
    }

    /// Drops every hard-expired entry.
    pub fn delete_expired(&self) {
        sweep(&self.items);
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn stats(&self) -> TierSnapshot {
        self.stats.snapshot()
    }

    /// Replaces the sweep interval. Takes effect on the next
    /// [`start_scan`](Self::start_scan).
    pub fn set_clean_interval(&self, clean_interval: Duration) {
        *self.clean_interval.lock() = clean_interval;
    }

    /// Starts the background sweeper; no-op if it is already running.
    pub fn start_scan(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        // tokio's interval panics on a zero period.
        let period = (*self.clean_interval.lock()).max(Duration::from_millis(1));
        let items = Arc::clone(&self.items);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweep(&items);
            }
        }));
    }

    /// Stops the background sweeper. Safe to call repeatedly and to follow
    /// with [`start_scan`](Self::start_scan) — the debug reconfiguration
    /// path does exactly that.
    pub fn stop_scan(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for MemCache {
    fn drop(&mut self) {
        self.stop_scan();
    }
}

fn sweep(items: &DashMap<String, Entry>) {
    let before = items.len();
    items.retain(|_, entry| !entry.expired());
    let removed = before.saturating_sub(items.len());
    if removed > 0 {
        debug!(removed, "swept expired mem entries");
    }
}

//! Cached value wrapper with soft and hard expirations.
//!
//! An [`Entry`] carries the caller's value as raw JSON plus an absolute
//! hard expiration. The soft expiration is derived, not stored: the last
//! `1/LAZY_FACTOR` of the lifetime is the window in which reads still
//! succeed but trigger a background refresh.

use std::sync::Arc;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::value::RawValue;
use time::OffsetDateTime;

/// The soft window is the last `ttl / LAZY_FACTOR` of an entry's lifetime.
pub const LAZY_FACTOR: i64 = 256;

const NANOS_PER_SEC: i64 = 1_000_000_000;

fn now_nanos() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}

/// A cached value with expiration metadata.
///
/// Entries are immutable once constructed; a refresh produces a new entry
/// that replaces the mapping atomically. The wire form is a self-describing
/// JSON envelope (`object`, `expiration`, `ttl`) that round-trips the
/// absolute expiration so nodes with synchronized clocks agree on
/// freshness. The payload stays raw JSON end to end; typed decode happens
/// at hand-off via [`Entry::object`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    #[serde(with = "raw_object")]
    object: Arc<RawValue>,
    /// Absolute hard expiration, nanoseconds since the Unix epoch.
    expiration: i64,
    /// Original TTL in seconds; the soft window is recomputed from it on
    /// decode rather than transmitted.
    ttl: u64,
}

impl Entry {
    /// Wraps `value` with an expiration `ttl_secs` from now.
    ///
    /// TTLs below one second are raised to one second.
    pub fn new<T: Serialize + ?Sized>(value: &T, ttl_secs: u64) -> Result<Self, serde_json::Error> {
        let ttl = ttl_secs.max(1);
        let object = serde_json::value::to_raw_value(value)?;
        Ok(Self {
            object: Arc::from(object),
            expiration: now_nanos() + ttl as i64 * NANOS_PER_SEC,
            ttl,
        })
    }

    /// Absolute hard expiration, nanoseconds since the Unix epoch.
    pub fn expiration(&self) -> i64 {
        self.expiration
    }

    /// Instant at which the soft window opens.
    pub fn soft_expiration(&self) -> i64 {
        self.expiration - self.ttl as i64 * NANOS_PER_SEC / LAZY_FACTOR
    }

    /// True once the entry is inside its soft window: still serveable, but
    /// reads should dispatch a background refresh.
    pub fn outdated(&self) -> bool {
        now_nanos() > self.soft_expiration()
    }

    /// True once the entry must no longer be served.
    pub fn expired(&self) -> bool {
        now_nanos() > self.expiration
    }

    /// Seconds until hard expiration, floored at one. Used as the TTL for
    /// the remote-store write so Redis expiry stays authoritative.
    pub fn remaining_ttl_secs(&self) -> u64 {
        ((self.expiration - now_nanos()) / NANOS_PER_SEC).max(1) as u64
    }

    /// Materializes a fresh `T` from the stored payload.
    ///
    /// Every call decodes anew, so the returned value never aliases cache
    /// state.
    pub fn object<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.object.get())
    }
}

mod raw_object {
    use std::sync::Arc;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::value::RawValue;

    pub fn serialize<S: Serializer>(value: &Arc<RawValue>, serializer: S) -> Result<S::Ok, S::Error> {
        (**value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<RawValue>, D::Error> {
        Box::<RawValue>::deserialize(deserializer).map(Arc::from)
    }
}

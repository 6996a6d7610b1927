//! Process-local building blocks for the tidecache two-tier cache.
//!
//! This crate holds everything that does not talk to Redis: the cached
//! [`Entry`] with its soft/hard expirations, the in-memory tier
//! ([`MemCache`]) with its background sweeper, and per-tier statistics.

pub mod entry;
pub mod key;
pub mod mem;
pub mod stats;

pub use entry::{Entry, LAZY_FACTOR};
pub use key::make_key;
pub use mem::{DEFAULT_CLEAN_INTERVAL, MemCache};
pub use stats::{TierSnapshot, TierStats};

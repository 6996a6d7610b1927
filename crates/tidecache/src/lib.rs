//! Two-tier read-through cache with cross-node invalidation.
//!
//! ## Architecture
//!
//! - **Mem tier** (DashMap): in-process, microsecond reads, per node.
//! - **Redis tier**: shared across nodes, millisecond reads, its expiry is
//!   authoritative cluster-wide.
//! - **Invalidation bus**: deletions fan out over Redis pub/sub so every
//!   node flushes both tiers.
//!
//! ```text
//! get_object → mem tier → redis tier → loader
//!                  ↑           ↑           │
//!                  └─ promote ─┴── fill ───┘
//! ```
//!
//! Entries carry a hard expiration and a derived soft expiration (the last
//! 1/256 of the lifetime). Inside the soft window reads still return the
//! cached value but kick off a background reload, so callers never wait on
//! a refresh. Per-key write locks collapse thundering herds to a single
//! loader run per process.
//!
//! ## Example
//!
//! ```ignore
//! let cache = tidecache::Cache::new("app", "127.0.0.1:6379", "", 16)?;
//!
//! let user: User = cache
//!     .get_object("user:42", 60, || async { fetch_user(42).await })
//!     .await?;
//!
//! cache.delete("user:42").await?; // flushes every node
//! ```

pub mod cache;
pub mod config;
pub mod error;

mod backend;
mod pubsub;

pub use cache::{Cache, CacheStats};
pub use config::CacheConfig;
pub use error::{BoxError, CacheError};
pub use tidecache_core::{Entry, LAZY_FACTOR, TierSnapshot, make_key};

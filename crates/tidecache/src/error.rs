//! Cache error types.

use thiserror::Error;

/// Boxed error produced by a caller-supplied loader.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by cache operations.
///
/// Read paths favor availability: Redis transport and decode failures are
/// logged and degrade to a miss, so callers only ever see them from write
/// paths (a load that could not publish its result).
#[derive(Debug, Error)]
pub enum CacheError {
    /// Error returned by the caller's loader, propagated unchanged.
    #[error("loader error: {0}")]
    Loader(#[source] BoxError),

    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("redis transport error: {0}")]
    Transport(#[from] redis::RedisError),

    /// Malformed payload from the remote store.
    #[error("malformed cache payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// Failure to materialize a value on hand-off to the caller.
    #[error("failed to materialize cached value: {0}")]
    Copy(#[source] serde_json::Error),

    /// Fatal to the current pub/sub subscription; the bus reconnects.
    #[error("subscriber error: {0}")]
    Subscribe(String),

    #[error("configuration error: {0}")]
    Config(String),
}

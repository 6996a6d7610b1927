//! Cross-node invalidation over Redis pub/sub.
//!
//! Deletions are published on the `delkey` channel and applied by every
//! subscriber, the originator included; there is no self-suppression. Each
//! node removes the key from its mem tier and issues the Redis delete —
//! the Redis side is idempotent across nodes.

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::Pool;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use tidecache_core::MemCache;

use crate::backend::RedisTier;
use crate::error::CacheError;

/// Channel carrying cluster-wide key deletions.
pub(crate) const DEL_KEY_CHANNEL: &str = "delkey";

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Publishes a key deletion to every node, the publisher included.
pub(crate) async fn publish_delete(pool: &Pool, key: &str) -> Result<(), CacheError> {
    let mut conn = pool.get().await?;
    conn.publish::<_, _, ()>(DEL_KEY_CHANNEL, key).await?;
    debug!(key = %key, "published key deletion");
    Ok(())
}

/// Long-lived subscriber applying received deletions to both tiers.
pub(crate) struct InvalidationListener {
    pub(crate) redis_url: String,
    pub(crate) mem: Arc<MemCache>,
    pub(crate) redis: Arc<RedisTier>,
}

impl InvalidationListener {
    /// Runs the subscription, reconnecting with backoff on failure.
    pub(crate) async fn run(self) {
        info!(channel = DEL_KEY_CHANNEL, "starting invalidation listener");
        loop {
            if let Err(e) = self.subscribe_loop().await {
                error!(error = %e, "invalidation listener failed, reconnecting");
                sleep(RECONNECT_BACKOFF).await;
            }
        }
    }

    async fn subscribe_loop(&self) -> Result<(), CacheError> {
        // Pooled connections cannot SUBSCRIBE; use a dedicated client.
        let client = redis::Client::open(self.redis_url.as_str())
            .map_err(|e| CacheError::Subscribe(e.to_string()))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::Subscribe(e.to_string()))?;
        pubsub
            .subscribe(DEL_KEY_CHANNEL)
            .await
            .map_err(|e| CacheError::Subscribe(e.to_string()))?;

        info!(channel = DEL_KEY_CHANNEL, "subscribed to deletion channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let key: String = match msg.get_payload() {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "undecodable deletion message");
                    continue;
                }
            };

            debug!(key = %key, "applying key deletion");
            self.mem.delete(&key);
            if let Err(e) = self.redis.delete(&key).await {
                warn!(key = %key, error = %e, "redis delete failed");
            }
        }

        Err(CacheError::Subscribe("pub/sub stream ended".into()))
    }
}

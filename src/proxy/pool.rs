//! Downstream gRPC channel pool
//!
//! One channel per `host:port` authority, shared by every request and kept
//! for the process lifetime. Lookups take the read lock; the first request
//! for a new authority upgrades to the write lock and dials once, with a
//! second lookup after the upgrade so concurrent upgraders reuse the winner's
//! channel.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::error::Error;

/// Pool of lazily-dialed channels keyed by authority.
pub struct ChannelPool {
    channels: RwLock<HashMap<String, Channel>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl ChannelPool {
    /// Create an empty pool with the given dial and per-request timeouts.
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            connect_timeout,
            request_timeout,
        }
    }

    /// The channel for `authority` (`host:port`), dialing it on first use.
    ///
    /// Dialing is lazy: transport failures surface on the first call, not
    /// here.
    pub async fn channel(&self, authority: &str) -> Result<Channel, Error> {
        if let Some(channel) = self.channels.read().await.get(authority) {
            return Ok(channel.clone());
        }

        let mut channels = self.channels.write().await;
        // Double-check: another request may have dialed while we upgraded.
        if let Some(channel) = channels.get(authority) {
            return Ok(channel.clone());
        }

        debug!(authority, "Opening downstream channel");
        let channel = Endpoint::from_shared(format!("http://{}", authority))
            .map_err(|e| Error::transport(format!("invalid authority {}: {}", authority, e)))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .connect_lazy();
        channels.insert(authority.to_string(), channel.clone());
        Ok(channel)
    }

    /// Drop every pooled channel (shutdown).
    pub async fn clear(&self) {
        self.channels.write().await.clear();
    }

    /// Number of pooled channels.
    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Whether the pool holds no channels.
    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ChannelPool {
        ChannelPool::new(Duration::from_secs(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn same_authority_reuses_the_channel() {
        let pool = pool();
        pool.channel("localhost:50051").await.unwrap();
        pool.channel("localhost:50051").await.unwrap();
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn distinct_authorities_get_distinct_channels() {
        let pool = pool();
        pool.channel("localhost:50051").await.unwrap();
        pool.channel("localhost:50052").await.unwrap();
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn invalid_authority_is_a_transport_error() {
        let pool = pool();
        assert!(matches!(
            pool.channel("not an authority").await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn clear_empties_the_pool() {
        let pool = pool();
        pool.channel("localhost:50051").await.unwrap();
        pool.clear().await;
        assert!(pool.is_empty().await);
    }
}

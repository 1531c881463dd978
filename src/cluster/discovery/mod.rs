//! Service discovery seam and adapters
//!
//! A discovery backend registers this node with the rest of the fleet and
//! pushes complete membership snapshots (never deltas) to every subscriber.
//! Member wire encoding is `host:restPort:grpcPort`.
//!
//! Three adapters exist: Consul (TTL health check), etcd (lease-scoped
//! registration keys) and Kubernetes (Endpoints watch).

mod consul;
mod etcd;
mod kubernetes;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

pub use consul::ConsulDiscovery;
pub use etcd::EtcdDiscovery;
pub use kubernetes::KubernetesDiscovery;

use super::Member;
use crate::error::Error;

/// A service discovery backend.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Register this node with the backend and start pushing snapshots.
    async fn register(&self) -> Result<(), Error>;

    /// Withdraw this node's registration.
    async fn unregister(&self) -> Result<(), Error>;

    /// Add a snapshot subscriber under `key`. The subscriber receives every
    /// future snapshot until unsubscribed.
    async fn subscribe(&self, key: &str, tx: mpsc::Sender<Vec<Member>>);

    /// Remove the subscriber registered under `key`.
    async fn unsubscribe(&self, key: &str);
}

/// Keyed set of snapshot subscribers, shared by all adapters.
#[derive(Default)]
pub struct Subscriptions {
    senders: RwLock<HashMap<String, mpsc::Sender<Vec<Member>>>>,
}

impl Subscriptions {
    /// Create an empty subscriber set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber under `key`, replacing any previous one.
    pub async fn add(&self, key: &str, tx: mpsc::Sender<Vec<Member>>) {
        self.senders.write().await.insert(key.to_string(), tx);
    }

    /// Remove the subscriber under `key`.
    pub async fn remove(&self, key: &str) {
        self.senders.write().await.remove(key);
    }

    /// Deliver a snapshot to every subscriber. Slow or gone subscribers are
    /// skipped rather than blocking the push stream.
    pub async fn broadcast(&self, members: &[Member]) {
        let senders = self.senders.read().await;
        for tx in senders.values() {
            let _ = tx.send(members.to_vec()).await;
        }
    }
}

//! etcd discovery adapter
//!
//! Each node writes its member record to `/service/{name}/{id}` under a
//! lease of `ttl` seconds and refreshes it at half that interval while
//! healthy; a stale node's key expires with its lease. Membership comes from
//! a prefix watch that reassembles the node map from create/modify/delete
//! events and broadcasts the full snapshot on every change.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{DiscoveryBackend, Subscriptions};
use crate::cluster::Member;
use crate::error::Error;
use crate::proxy::HealthFlag;

/// Backoff after a failed watch before re-establishing it
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// etcd-backed discovery with lease-scoped registration keys.
pub struct EtcdDiscovery {
    client: Client,
    service_prefix: String,
    service_key: String,
    ttl: Duration,
    advertised: Member,
    health: HealthFlag,
    subs: Arc<Subscriptions>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl EtcdDiscovery {
    /// Connect to etcd and prepare the adapter. `service_id` defaults to a
    /// random id so replicas of one deployment never collide.
    pub async fn connect(
        endpoints: &[String],
        credentials: Option<(String, String)>,
        service_name: &str,
        service_id: Option<String>,
        ttl: Duration,
        advertised: Member,
        health: HealthFlag,
    ) -> Result<Self, Error> {
        let options = credentials
            .map(|(user, password)| ConnectOptions::new().with_user(user, password));
        let client = Client::connect(endpoints, options)
            .await
            .map_err(|e| Error::discovery(format!("cannot connect to etcd: {}", e)))?;

        let service_id = service_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let service_prefix = format!("/service/{}/", service_name);
        let service_key = format!("{}{}", service_prefix, service_id);

        Ok(Self {
            client,
            service_prefix,
            service_key,
            ttl,
            advertised,
            health,
            subs: Arc::new(Subscriptions::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let mut client = self.client.clone();
        let key = self.service_key.clone();
        let value = self.advertised.to_string();
        let ttl = self.ttl;
        let health = self.health.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl / 2);
            loop {
                ticker.tick().await;
                if !health.is_healthy() {
                    // Let the lease lapse so peers drop this node.
                    debug!("Node unhealthy, skipping registration refresh");
                    continue;
                }
                let lease = match client.lease_grant(ttl.as_secs() as i64, None).await {
                    Ok(lease) => lease,
                    Err(e) => {
                        error!(error = %e, "Could not grant etcd lease");
                        continue;
                    }
                };
                let options = PutOptions::new().with_lease(lease.id());
                if let Err(e) = client.put(key.as_str(), value.as_str(), Some(options)).await {
                    error!(error = %e, "Could not refresh etcd registration");
                }
            }
        })
    }

    fn spawn_watch(&self) -> JoinHandle<()> {
        let mut client = self.client.clone();
        let prefix = self.service_prefix.clone();
        let subs = self.subs.clone();
        tokio::spawn(async move {
            let mut nodes: BTreeMap<String, String> = BTreeMap::new();
            loop {
                let (watcher, mut stream) = match client
                    .watch(prefix.as_str(), Some(WatchOptions::new().with_prefix()))
                    .await
                {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "Could not establish etcd watch");
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        continue;
                    }
                };

                loop {
                    let response = match stream.message().await {
                        Ok(Some(response)) => response,
                        Ok(None) => {
                            warn!("etcd watch stream closed, re-establishing");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Error reading etcd watch stream");
                            tokio::time::sleep(WATCH_RETRY_DELAY).await;
                            break;
                        }
                    };

                    let mut updated = false;
                    for event in response.events() {
                        let Some(kv) = event.kv() else { continue };
                        let Ok(key) = kv.key_str() else { continue };
                        match event.event_type() {
                            EventType::Put => {
                                let Ok(value) = kv.value_str() else { continue };
                                let previous = nodes.insert(key.to_string(), value.to_string());
                                updated |= previous.as_deref() != Some(value);
                            }
                            EventType::Delete => {
                                updated |= nodes.remove(key).is_some();
                            }
                        }
                    }

                    if updated {
                        let members = members_from_nodes(&nodes);
                        debug!(count = members.len(), "etcd membership snapshot");
                        subs.broadcast(&members).await;
                    }
                }
                drop(watcher);
            }
        })
    }
}

#[async_trait]
impl DiscoveryBackend for EtcdDiscovery {
    async fn register(&self) -> Result<(), Error> {
        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_heartbeat());
        tasks.push(self.spawn_watch());
        Ok(())
    }

    async fn unregister(&self) -> Result<(), Error> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let mut client = self.client.clone();
        client
            .delete(self.service_key.as_str(), None)
            .await
            .map_err(|e| Error::discovery(format!("cannot delete registration key: {}", e)))?;
        Ok(())
    }

    async fn subscribe(&self, key: &str, tx: mpsc::Sender<Vec<Member>>) {
        self.subs.add(key, tx).await;
    }

    async fn unsubscribe(&self, key: &str) {
        self.subs.remove(key).await;
    }
}

fn members_from_nodes(nodes: &BTreeMap<String, String>) -> Vec<Member> {
    let mut members = Vec::with_capacity(nodes.len());
    for (key, value) in nodes {
        match value.parse::<Member>() {
            Ok(member) => members.push(member),
            Err(_) => warn!(key = %key, value = %value, "Invalid member in registry, skipping"),
        }
    }
    members
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_map_parses_wire_members() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/service/mantle/a".to_string(),
            "10.0.0.1:8091:8092".to_string(),
        );
        nodes.insert("/service/mantle/b".to_string(), "garbage".to_string());
        nodes.insert(
            "/service/mantle/c".to_string(),
            "10.0.0.2:8091:8092".to_string(),
        );

        let members = members_from_nodes(&nodes);
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].host, "10.0.0.1");
        assert_eq!(members[1].host, "10.0.0.2");
    }
}

//! Consul discovery adapter
//!
//! Registers the node as a Consul service with a TTL health check and learns
//! the membership by polling the health API for passing instances. The REST
//! port is the service port; the gRPC port travels in service metadata.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{DiscoveryBackend, Subscriptions};
use crate::cluster::Member;
use crate::error::Error;
use crate::proxy::HealthFlag;

/// Poll interval for the passing-instance list
const MEMBER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Service metadata key carrying the gRPC port
const GRPC_PORT_META: &str = "grpcPort";

/// Consul-backed discovery.
pub struct ConsulDiscovery {
    client: reqwest::Client,
    base_url: String,
    service_name: String,
    service_id: String,
    ttl: Duration,
    advertised: Member,
    health: HealthFlag,
    subs: Arc<Subscriptions>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ConsulDiscovery {
    /// Create an adapter against the agent at `base_url`.
    ///
    /// `service_id` falls back to the service name; `advertised` is the
    /// member record registered for this node.
    pub fn new(
        base_url: impl Into<String>,
        service_name: impl Into<String>,
        service_id: Option<String>,
        ttl: Duration,
        advertised: Member,
        health: HealthFlag,
    ) -> Self {
        let service_name = service_name.into();
        let service_id = service_id.unwrap_or_else(|| service_name.clone());
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_name,
            service_id,
            ttl,
            advertised,
            health,
            subs: Arc::new(Subscriptions::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    async fn register_service(&self) -> Result<(), Error> {
        let body = json!({
            "Name": self.service_name,
            "ID": self.service_id,
            "Address": self.advertised.host,
            "Port": self.advertised.rest_port,
            "Meta": { GRPC_PORT_META: self.advertised.grpc_port.to_string() },
            "Check": {
                "TTL": format!("{}s", self.ttl.as_secs()),
                "DeregisterCriticalServiceAfter": format!("{}s", self.ttl.as_secs() * 100),
            },
        });
        let url = format!("{}/v1/agent/service/register", self.base_url);
        self.client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::discovery(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::discovery(format!("service registration refused: {}", e)))?;
        Ok(())
    }

    fn spawn_ttl_updates(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let url = format!(
            "{}/v1/agent/check/update/service:{}",
            self.base_url, self.service_id
        );
        let health = self.health.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl / 2);
            loop {
                ticker.tick().await;
                let status = if health.is_healthy() {
                    "passing"
                } else {
                    "critical"
                };
                let result = client
                    .put(&url)
                    .json(&json!({ "Status": status }))
                    .send()
                    .await;
                if let Err(e) = result {
                    error!(error = %e, "Error updating consul TTL check");
                }
            }
        })
    }

    fn spawn_member_poll(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let url = format!(
            "{}/v1/health/service/{}?passing=true",
            self.base_url, self.service_name
        );
        let subs = self.subs.clone();
        tokio::spawn(async move {
            loop {
                match client.get(&url).send().await {
                    Ok(response) => match response.json::<Vec<HealthEntry>>().await {
                        Ok(entries) => {
                            let members = members_from_entries(&entries);
                            debug!(count = members.len(), "Consul membership poll");
                            subs.broadcast(&members).await;
                        }
                        Err(e) => error!(error = %e, "Error parsing consul health response"),
                    },
                    Err(e) => error!(error = %e, "Error polling consul services"),
                }
                tokio::time::sleep(MEMBER_POLL_INTERVAL).await;
            }
        })
    }
}

#[async_trait]
impl DiscoveryBackend for ConsulDiscovery {
    async fn register(&self) -> Result<(), Error> {
        self.register_service().await?;
        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_ttl_updates());
        tasks.push(self.spawn_member_poll());
        Ok(())
    }

    async fn unregister(&self) -> Result<(), Error> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.base_url, self.service_id
        );
        self.client
            .put(&url)
            .send()
            .await
            .map_err(|e| Error::discovery(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::discovery(format!("deregistration refused: {}", e)))?;
        Ok(())
    }

    async fn subscribe(&self, key: &str, tx: mpsc::Sender<Vec<Member>>) {
        self.subs.add(key, tx).await;
    }

    async fn unsubscribe(&self, key: &str) {
        self.subs.remove(key).await;
    }
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: NodeInfo,
    #[serde(rename = "Service")]
    service: ServiceInfo,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    #[serde(rename = "Address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct ServiceInfo {
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

fn members_from_entries(entries: &[HealthEntry]) -> Vec<Member> {
    let mut members = Vec::with_capacity(entries.len());
    for entry in entries {
        let host = if entry.service.address.is_empty() {
            // Fall back to the node address.
            entry.node.address.clone()
        } else {
            entry.service.address.clone()
        };
        let grpc_port = entry
            .service
            .meta
            .get(GRPC_PORT_META)
            .and_then(|p| p.parse::<u16>().ok());
        match grpc_port {
            Some(grpc_port) => members.push(Member {
                host,
                rest_port: entry.service.port,
                grpc_port,
            }),
            None => {
                warn!(host = %host, "Consul instance without a gRPC port, skipping");
            }
        }
    }
    members
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_entries_become_members() {
        let json = r#"[
            {
                "Node": {"Address": "10.0.0.1"},
                "Service": {"Address": "10.0.0.2", "Port": 8091, "Meta": {"grpcPort": "8092"}}
            },
            {
                "Node": {"Address": "10.0.0.3"},
                "Service": {"Address": "", "Port": 8091, "Meta": {"grpcPort": "8092"}}
            }
        ]"#;
        let entries: Vec<HealthEntry> = serde_json::from_str(json).unwrap();
        let members = members_from_entries(&entries);
        assert_eq!(members.len(), 2);
        // Explicit service address wins; node address is the fallback.
        assert_eq!(members[0].host, "10.0.0.2");
        assert_eq!(members[1].host, "10.0.0.3");
        assert_eq!(members[0].grpc_port, 8092);
    }

    #[test]
    fn instances_without_grpc_port_are_skipped() {
        let json = r#"[
            {"Node": {"Address": "10.0.0.1"}, "Service": {"Address": "", "Port": 8091}}
        ]"#;
        let entries: Vec<HealthEntry> = serde_json::from_str(json).unwrap();
        assert!(members_from_entries(&entries).is_empty());
    }
}

//! Kubernetes discovery adapter
//!
//! Watches the Endpoints object selected by the configured field selector
//! and turns its address list into membership snapshots. Registration and
//! deregistration are no-ops: the orchestrator owns the instance lifecycle
//! through readiness probes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::Api;
use kube::runtime::watcher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{DiscoveryBackend, Subscriptions};
use crate::cluster::Member;
use crate::config::K8sDiscoverySettings;
use crate::error::Error;

/// Path of the mounted service-account namespace file
const NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Backoff after a failed watch before re-establishing it
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Kubernetes Endpoints-watch discovery.
pub struct KubernetesDiscovery {
    client: kube::Client,
    namespace: String,
    field_selector: String,
    grpc_port_name: String,
    http_port_name: String,
    subs: Arc<Subscriptions>,
    watch_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl KubernetesDiscovery {
    /// Create an adapter from the in-cluster config.
    pub async fn new(settings: &K8sDiscoverySettings) -> Result<Self, Error> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| Error::discovery(format!("cannot create kubernetes client: {}", e)))?;

        let namespace = match &settings.namespace {
            Some(ns) => ns.clone(),
            None => pod_namespace().await?,
        };

        let mut selector: Vec<String> = settings
            .field_selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        selector.sort();

        Ok(Self {
            client,
            namespace,
            field_selector: selector.join(","),
            grpc_port_name: settings.port_names.grpc_cache.clone(),
            http_port_name: settings.port_names.http_cache.clone(),
            subs: Arc::new(Subscriptions::new()),
            watch_task: parking_lot::Mutex::new(None),
        })
    }

    fn spawn_watch(&self) -> JoinHandle<()> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut config = watcher::Config::default();
        if !self.field_selector.is_empty() {
            config = config.fields(&self.field_selector);
        }
        let subs = self.subs.clone();
        let grpc_port_name = self.grpc_port_name.clone();
        let http_port_name = self.http_port_name.clone();

        tokio::spawn(async move {
            loop {
                let mut stream = Box::pin(watcher(api.clone(), config.clone()));
                loop {
                    match stream.try_next().await {
                        Ok(Some(watcher::Event::Apply(endpoints)))
                        | Ok(Some(watcher::Event::InitApply(endpoints))) => {
                            let members = endpoints_to_members(
                                &endpoints,
                                &grpc_port_name,
                                &http_port_name,
                            );
                            debug!(count = members.len(), "Kubernetes endpoints snapshot");
                            subs.broadcast(&members).await;
                        }
                        Ok(Some(watcher::Event::Delete(_))) => {
                            // The service is gone; no peers remain.
                            subs.broadcast(&[]).await;
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "Error watching kubernetes endpoints");
                            tokio::time::sleep(WATCH_RETRY_DELAY).await;
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl DiscoveryBackend for KubernetesDiscovery {
    async fn register(&self) -> Result<(), Error> {
        *self.watch_task.lock() = Some(self.spawn_watch());
        Ok(())
    }

    async fn unregister(&self) -> Result<(), Error> {
        // The orchestrator withdraws this node by itself.
        if let Some(task) = self.watch_task.lock().take() {
            task.abort();
        }
        Ok(())
    }

    async fn subscribe(&self, key: &str, tx: mpsc::Sender<Vec<Member>>) {
        self.subs.add(key, tx).await;
    }

    async fn unsubscribe(&self, key: &str) {
        self.subs.remove(key).await;
    }
}

/// Namespace of the pod this process runs in.
async fn pod_namespace() -> Result<String, Error> {
    let raw = tokio::fs::read_to_string(NAMESPACE_PATH)
        .await
        .map_err(|e| Error::discovery(format!("cannot read pod namespace: {}", e)))?;
    let namespace = raw.trim().to_string();
    if namespace.is_empty() {
        return Err(Error::discovery("pod namespace file is empty".to_string()));
    }
    Ok(namespace)
}

/// Translate an Endpoints object into members using the named ports.
fn endpoints_to_members(
    endpoints: &Endpoints,
    grpc_port_name: &str,
    http_port_name: &str,
) -> Vec<Member> {
    let mut members = Vec::new();
    let Some(subsets) = &endpoints.subsets else {
        return members;
    };

    for subset in subsets {
        let mut grpc_port = 0u16;
        let mut rest_port = 0u16;
        if let Some(ports) = &subset.ports {
            for port in ports {
                match port.name.as_deref() {
                    Some(name) if name == grpc_port_name => grpc_port = port.port as u16,
                    Some(name) if name == http_port_name => rest_port = port.port as u16,
                    _ => {}
                }
            }
        }
        if let Some(addresses) = &subset.addresses {
            for address in addresses {
                members.push(Member {
                    host: address.ip.clone(),
                    rest_port,
                    grpc_port,
                });
            }
        }
    }
    members
}

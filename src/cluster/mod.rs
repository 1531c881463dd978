//! Cluster membership and key placement
//!
//! A node joins the cluster through a discovery backend, consumes complete
//! membership snapshots from it, and keeps a consistent-hash ring in sync so
//! the proxy role can place every (model, version) key on its owning
//! replicas.

pub mod discovery;
pub mod ring;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Error;
use discovery::DiscoveryBackend;
use ring::{HashRing, VIRTUAL_NODES};

/// Subscription key used for the ring-updating consumer
const CLUSTER_SUBSCRIPTION: &str = "cluster";

/// Snapshot channel depth; discovery pushes are small and infrequent
const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

/// A peer replica, reachable on separate REST and gRPC ports.
///
/// The canonical string form `host:restPort:grpcPort` is the wire encoding
/// shared with every discovery backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    /// Host or IP
    pub host: String,
    /// REST port
    pub rest_port: u16,
    /// gRPC port
    pub grpc_port: u16,
}

impl Member {
    /// `host:port` authority of the REST listener.
    pub fn rest_authority(&self) -> String {
        format!("{}:{}", self.host, self.rest_port)
    }

    /// `host:port` authority of the gRPC listener.
    pub fn grpc_authority(&self) -> String {
        format!("{}:{}", self.host, self.grpc_port)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.rest_port, self.grpc_port)
    }
}

impl FromStr for Member {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(Error::InvalidMember(s.to_string()));
        }
        let rest_port = parts[1]
            .parse::<u16>()
            .map_err(|_| Error::InvalidMember(s.to_string()))?;
        let grpc_port = parts[2]
            .parse::<u16>()
            .map_err(|_| Error::InvalidMember(s.to_string()))?;
        Ok(Member {
            host: parts[0].to_string(),
            rest_port,
            grpc_port,
        })
    }
}

/// Lifecycle state of the cluster connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Constructed, not registered
    Ready,
    /// Registered and consuming membership snapshots
    Started,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Ready => write!(f, "READY"),
            ClusterState::Started => write!(f, "STARTED"),
        }
    }
}

/// A node's connection to the cluster: registration with the discovery
/// backend plus the ring kept current from its snapshots.
pub struct ClusterConnection {
    discovery: Arc<dyn DiscoveryBackend>,
    ring: Arc<RwLock<HashRing>>,
    replicas_per_model: usize,
    state: parking_lot::Mutex<ClusterState>,
    consumer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ClusterConnection {
    /// Create a connection in the READY state.
    pub fn new(discovery: Arc<dyn DiscoveryBackend>, replicas_per_model: usize) -> Self {
        Self {
            discovery,
            ring: Arc::new(RwLock::new(HashRing::new(VIRTUAL_NODES))),
            replicas_per_model: replicas_per_model.max(1),
            state: parking_lot::Mutex::new(ClusterState::Ready),
            consumer: parking_lot::Mutex::new(None),
        }
    }

    /// Register with the discovery backend, subscribe to snapshots and start
    /// the ring-updating consumer. Legal only in READY.
    pub async fn connect(&self) -> Result<(), Error> {
        {
            let state = self.state.lock();
            if *state != ClusterState::Ready {
                return Err(Error::ClusterState("connect requires READY"));
            }
        }

        let (tx, mut rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        self.discovery.subscribe(CLUSTER_SUBSCRIPTION, tx).await;

        if let Err(e) = self.discovery.register().await {
            error!(error = %e, "Could not register with discovery backend");
            self.discovery.unsubscribe(CLUSTER_SUBSCRIPTION).await;
            return Err(e);
        }

        let ring = self.ring.clone();
        let handle = tokio::spawn(async move {
            while let Some(members) = rx.recv().await {
                debug!(count = members.len(), "Membership snapshot received");
                if let Ok(mut ring) = ring.write() {
                    ring.set_members(&members);
                }
            }
        });

        *self.consumer.lock() = Some(handle);
        *self.state.lock() = ClusterState::Started;
        info!("Connected to cluster");
        Ok(())
    }

    /// Unsubscribe, deregister and stop the consumer. Legal only in STARTED.
    pub async fn disconnect(&self) -> Result<(), Error> {
        {
            let state = self.state.lock();
            if *state != ClusterState::Started {
                return Err(Error::ClusterState("disconnect requires STARTED"));
            }
        }

        self.discovery.unsubscribe(CLUSTER_SUBSCRIPTION).await;
        *self.state.lock() = ClusterState::Ready;

        if let Some(handle) = self.consumer.lock().take() {
            handle.abort();
        }

        if let Err(e) = self.discovery.unregister().await {
            error!(error = %e, "Could not unregister from discovery backend");
            return Err(e);
        }
        info!("Disconnected from cluster");
        Ok(())
    }

    /// The R replicas owning a routing key, in ring order.
    pub fn find_nodes_for_key(&self, key: &str) -> Result<Vec<Member>, Error> {
        let ring = self
            .ring
            .read()
            .map_err(|_| Error::ClusterState("ring lock poisoned"))?;
        ring.lookup(key, self.replicas_per_model)
    }

    /// Current state (READY or STARTED).
    pub fn state(&self) -> ClusterState {
        *self.state.lock()
    }
}

/// The address this node advertises to its peers.
///
/// Opens a UDP socket towards a public address to learn the preferred
/// outbound interface; nothing is sent. Falls back to 127.0.0.1 when
/// `allow_localhost` is set.
pub fn outbound_ip(allow_localhost: bool) -> Result<IpAddr, Error> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| socket.connect("8.8.8.8:80").map(|_| socket))
        .and_then(|socket| socket.local_addr());
    match probe {
        Ok(addr) => Ok(addr.ip()),
        Err(e) if allow_localhost => {
            debug!(error = %e, "No outbound interface, advertising localhost");
            Ok(IpAddr::from([127, 0, 0, 1]))
        }
        Err(e) => Err(Error::discovery(format!(
            "cannot determine outbound ip: {}",
            e
        ))),
    }
}

//! Mantle - sharded caching proxy for a model-serving backend
//!
//! A backend can host many models but only a fixed working set at a time.
//! Mantle scales that horizontally: inference requests name a
//! (model, version) pair, the cluster routes each request consistently by
//! key to one of N replicas, and that replica materializes the model on
//! local disk and loads it into its serving backend before forwarding the
//! call.
//!
//! # Architecture
//!
//! Two roles are collocated in one process:
//!
//! - **Proxy role** - accepts client REST and gRPC requests, parses the
//!   model key, and forwards to the replica that owns it on the
//!   consistent-hash ring (replication factor R, random pick among owners).
//! - **Cache role** - accepts forwarded requests, keeps a bounded LRU of
//!   model artifacts on disk, reconciles the backend's loaded-model config
//!   with the cache contents, and forwards to the backend once the model is
//!   AVAILABLE.
//!
//! # Modules
//!
//! - [`cache`] - materialization cache, model providers, serving controller
//!   and the per-request fetch-and-load state machine
//! - [`cluster`] - membership, consistent-hash ring and discovery adapters
//!   (Consul, etcd, Kubernetes)
//! - [`proxy`] - REST reverse proxy, gRPC forwarder, channel pool and the
//!   gRPC health service
//! - [`router`] - proxy-role director (ring lookup + random owner pick)
//! - [`worker`] - cache-role director (ensure-loaded + local backend)
//! - [`config`] - YAML settings
//! - [`metrics`] - request/cache counters and the merged metrics endpoint
//! - [`error`] - error types and their REST/gRPC mappings

#![deny(missing_docs)]

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod router;
pub mod worker;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

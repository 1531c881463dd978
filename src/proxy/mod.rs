//! Transport proxies
//!
//! Pass-through forwarding for both request surfaces: an axum REST reverse
//! proxy and a tonic gRPC forwarder, plus the downstream channel pool and
//! the health service both gRPC listeners expose.

mod grpc;
mod health;
mod pool;
mod rest;

pub use grpc::{GrpcDirector, GrpcProxy};
pub use health::{HealthFlag, HealthService};
pub use pool::ChannelPool;
pub use rest::{RestDirector, RestProxy};

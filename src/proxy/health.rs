//! gRPC health service
//!
//! Serves `grpc.health.v1.Health` on both gRPC listeners, reflecting a
//! single node-wide health bit that the periodic probe loop toggles.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

use mantle_proto::health::v1::health_check_response::ServingStatus;
use mantle_proto::health::v1::health_server::{Health, HealthServer};
use mantle_proto::health::v1::{HealthCheckRequest, HealthCheckResponse};

/// Node-wide health bit, shared between the probe loop, the discovery
/// adapters and the health services.
#[derive(Clone)]
pub struct HealthFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl HealthFlag {
    /// Create a flag that starts healthy.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    /// Set the health bit.
    pub fn set(&self, healthy: bool) {
        self.tx.send_replace(healthy);
    }

    /// Current health bit.
    pub fn is_healthy(&self) -> bool {
        *self.tx.borrow()
    }

    /// A receiver that observes every change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for HealthFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// `grpc.health.v1.Health` implementation backed by a [`HealthFlag`].
pub struct HealthService {
    rx: watch::Receiver<bool>,
}

impl HealthService {
    /// Create a service observing the given flag.
    pub fn new(flag: &HealthFlag) -> Self {
        Self {
            rx: flag.subscribe(),
        }
    }

    /// Wrap into the generated tonic server.
    pub fn into_server(self) -> HealthServer<Self> {
        HealthServer::new(self)
    }
}

fn status_of(healthy: bool) -> ServingStatus {
    if healthy {
        ServingStatus::Serving
    } else {
        ServingStatus::NotServing
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let healthy = *self.rx.borrow();
        Ok(Response::new(HealthCheckResponse {
            status: status_of(healthy) as i32,
        }))
    }

    type WatchStream =
        Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let stream = WatchStream::new(self.rx.clone()).map(|healthy| {
            Ok(HealthCheckResponse {
                status: status_of(healthy) as i32,
            })
        });
        Ok(Response::new(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_reflects_the_flag() {
        let flag = HealthFlag::new();
        let service = HealthService::new(&flag);

        let response = service
            .check(Request::new(HealthCheckRequest::default()))
            .await
            .unwrap();
        assert_eq!(response.into_inner().status, ServingStatus::Serving as i32);

        flag.set(false);
        let response = service
            .check(Request::new(HealthCheckRequest::default()))
            .await
            .unwrap();
        assert_eq!(
            response.into_inner().status,
            ServingStatus::NotServing as i32
        );
    }

    #[tokio::test]
    async fn watch_streams_transitions() {
        let flag = HealthFlag::new();
        let service = HealthService::new(&flag);

        let mut stream = service
            .watch(Request::new(HealthCheckRequest::default()))
            .await
            .unwrap()
            .into_inner();

        // Current state is delivered first.
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.status, ServingStatus::Serving as i32);

        flag.set(false);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.status, ServingStatus::NotServing as i32);
    }
}

//! gRPC pass-through proxy
//!
//! Implements the inference services and forwards every call to the channel
//! a director resolves from the request's `ModelSpec`. Requests re-encode
//! unchanged because both sides speak the same proto package.
//! `MultiInference` is not supported and fails without contacting a replica.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};
use tracing::error;

use mantle_proto::serving::v1::prediction_service_client::PredictionServiceClient;
use mantle_proto::serving::v1::prediction_service_server::{
    PredictionService, PredictionServiceServer,
};
use mantle_proto::serving::v1::session_service_client::SessionServiceClient;
use mantle_proto::serving::v1::session_service_server::{SessionService, SessionServiceServer};
use mantle_proto::serving::v1::{
    ClassificationRequest, ClassificationResponse, GetModelMetadataRequest,
    GetModelMetadataResponse, ModelSpec, MultiInferenceRequest, MultiInferenceResponse,
    PredictRequest, PredictResponse, RegressionRequest, RegressionResponse, SessionRunRequest,
    SessionRunResponse,
};

use super::health::HealthService;
use crate::error::Error;
use crate::metrics::Metrics;

/// Resolves the downstream channel for a parsed (model, version).
///
/// The proxy role picks an owning replica; the cache role materializes the
/// model locally and returns the backend channel.
#[async_trait]
pub trait GrpcDirector: Send + Sync {
    /// Channel the request should be forwarded over.
    async fn channel_for(&self, model_name: &str, version: i64) -> Result<Channel, Error>;
}

/// gRPC proxy serving the inference surface.
#[derive(Clone)]
pub struct GrpcProxy {
    director: Arc<dyn GrpcDirector>,
    metrics: Arc<Metrics>,
    max_msg_size: usize,
}

impl GrpcProxy {
    /// Create a proxy handing parsed requests to `director`.
    pub fn new(director: Arc<dyn GrpcDirector>, metrics: Arc<Metrics>, max_msg_size: usize) -> Self {
        Self {
            director,
            metrics,
            max_msg_size,
        }
    }

    /// Serve the inference services plus the health service until the
    /// process stops.
    pub async fn serve(self, addr: SocketAddr, health: HealthService) -> Result<(), Error> {
        let max = self.max_msg_size;
        Server::builder()
            .add_service(
                PredictionServiceServer::new(self.clone())
                    .max_decoding_message_size(max)
                    .max_encoding_message_size(max),
            )
            .add_service(
                SessionServiceServer::new(self.clone())
                    .max_decoding_message_size(max)
                    .max_encoding_message_size(max),
            )
            .add_service(health.into_server())
            .serve(addr)
            .await
            .map_err(|e| Error::transport(e.to_string()))
    }

    async fn channel_for_spec(&self, spec: Option<&ModelSpec>) -> Result<Channel, Status> {
        self.metrics.grpc.record_request();
        let name = spec.map(|s| s.name.as_str()).unwrap_or_default();
        // A missing version routes as version 0; the backend surfaces the
        // resulting error.
        let version = spec.and_then(|s| s.version).unwrap_or_default();
        match self.director.channel_for(name, version).await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                self.metrics.grpc.record_failure();
                error!(error = %e, model = name, version, "Could not resolve downstream client");
                Err(e.into())
            }
        }
    }

    fn prediction_client(&self, channel: Channel) -> PredictionServiceClient<Channel> {
        PredictionServiceClient::new(channel)
            .max_decoding_message_size(self.max_msg_size)
            .max_encoding_message_size(self.max_msg_size)
    }
}

#[tonic::async_trait]
impl PredictionService for GrpcProxy {
    async fn classify(
        &self,
        request: Request<ClassificationRequest>,
    ) -> Result<Response<ClassificationResponse>, Status> {
        let request = request.into_inner();
        let channel = self.channel_for_spec(request.model_spec.as_ref()).await?;
        self.prediction_client(channel).classify(request).await
    }

    async fn regress(
        &self,
        request: Request<RegressionRequest>,
    ) -> Result<Response<RegressionResponse>, Status> {
        let request = request.into_inner();
        let channel = self.channel_for_spec(request.model_spec.as_ref()).await?;
        self.prediction_client(channel).regress(request).await
    }

    async fn predict(
        &self,
        request: Request<PredictRequest>,
    ) -> Result<Response<PredictResponse>, Status> {
        let request = request.into_inner();
        let channel = self.channel_for_spec(request.model_spec.as_ref()).await?;
        self.prediction_client(channel).predict(request).await
    }

    async fn multi_inference(
        &self,
        _request: Request<MultiInferenceRequest>,
    ) -> Result<Response<MultiInferenceResponse>, Status> {
        Err(Status::unimplemented("MultiInference not supported"))
    }

    async fn get_model_metadata(
        &self,
        request: Request<GetModelMetadataRequest>,
    ) -> Result<Response<GetModelMetadataResponse>, Status> {
        let request = request.into_inner();
        let channel = self.channel_for_spec(request.model_spec.as_ref()).await?;
        self.prediction_client(channel)
            .get_model_metadata(request)
            .await
    }
}

#[tonic::async_trait]
impl SessionService for GrpcProxy {
    async fn session_run(
        &self,
        request: Request<SessionRunRequest>,
    ) -> Result<Response<SessionRunResponse>, Status> {
        let request = request.into_inner();
        let channel = self.channel_for_spec(request.model_spec.as_ref()).await?;
        let mut client = SessionServiceClient::new(channel)
            .max_decoding_message_size(self.max_msg_size)
            .max_encoding_message_size(self.max_msg_size);
        client.session_run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingDirector {
        calls: parking_lot::Mutex<Vec<(String, i64)>>,
    }

    impl RecordingDirector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GrpcDirector for RecordingDirector {
        async fn channel_for(&self, model_name: &str, version: i64) -> Result<Channel, Error> {
            self.calls.lock().push((model_name.to_string(), version));
            // Routing failures short-circuit before any dial.
            Err(Error::NoMembers)
        }
    }

    fn proxy(director: Arc<RecordingDirector>) -> GrpcProxy {
        GrpcProxy::new(director, Arc::new(Metrics::new(false)), 16 * 1024 * 1024)
    }

    fn spec(name: &str, version: Option<i64>) -> Option<ModelSpec> {
        Some(ModelSpec {
            name: name.to_string(),
            version,
            signature_name: String::new(),
        })
    }

    #[tokio::test]
    async fn classify_extracts_spec_and_surfaces_routing_errors() {
        let director = RecordingDirector::new();
        let proxy = proxy(director.clone());

        let status = proxy
            .classify(Request::new(ClassificationRequest {
                model_spec: spec("foobar", Some(42)),
                input: None,
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(
            director.calls.lock().as_slice(),
            &[("foobar".to_string(), 42)]
        );
    }

    #[tokio::test]
    async fn missing_version_routes_as_zero() {
        let director = RecordingDirector::new();
        let proxy = proxy(director.clone());

        let _ = proxy
            .predict(Request::new(PredictRequest {
                model_spec: spec("foobar", None),
                ..Default::default()
            }))
            .await;

        assert_eq!(
            director.calls.lock().as_slice(),
            &[("foobar".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn multi_inference_fails_without_touching_the_director() {
        let director = RecordingDirector::new();
        let proxy = proxy(director.clone());

        let status = proxy
            .multi_inference(Request::new(MultiInferenceRequest::default()))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::Unimplemented);
        assert!(status.message().contains("MultiInference not supported"));
        assert!(director.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn session_run_goes_through_the_director() {
        let director = RecordingDirector::new();
        let proxy = proxy(director.clone());

        let _ = proxy
            .session_run(Request::new(SessionRunRequest {
                model_spec: spec("sess", Some(7)),
                ..Default::default()
            }))
            .await;

        assert_eq!(director.calls.lock().as_slice(), &[("sess".to_string(), 7)]);
    }
}

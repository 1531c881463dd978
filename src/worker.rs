//! Cache-role request director
//!
//! The worker side of a forwarded request: make sure the model is
//! materialized and loaded via the [`CacheManager`], then point the
//! transport proxies at the local serving backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};

use crate::cache::{CacheManager, ModelId};
use crate::error::Error;
use crate::proxy::{GrpcDirector, RestDirector};

/// Directs requests to the local backend after ensuring the model is loaded.
pub struct WorkerDirector {
    manager: Arc<CacheManager>,
    backend_rest: String,
    backend_channel: Channel,
}

impl WorkerDirector {
    /// Create a director for the backend at `rest_host` (full URL) and
    /// `grpc_host` (`host:port`). The gRPC channel is dialed lazily and
    /// shared by every forwarded call.
    pub fn new(
        manager: Arc<CacheManager>,
        rest_host: &str,
        grpc_host: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, Error> {
        let backend_channel = Endpoint::from_shared(format!("http://{}", grpc_host))
            .map_err(|e| Error::Config(format!("invalid serving gRPC host: {}", e)))?
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .connect_lazy();
        Ok(Self {
            manager,
            backend_rest: rest_host.trim_end_matches('/').to_string(),
            backend_channel,
        })
    }

    /// The cache manager behind this director.
    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }
}

#[async_trait]
impl RestDirector for WorkerDirector {
    async fn direct(&self, model_name: &str, version: &str) -> Result<String, Error> {
        let id = ModelId::parse(model_name, version)?;
        self.manager.ensure_model(&id).await?;
        Ok(self.backend_rest.clone())
    }
}

#[async_trait]
impl GrpcDirector for WorkerDirector {
    async fn channel_for(&self, model_name: &str, version: i64) -> Result<Channel, Error> {
        let id = ModelId::new(model_name, version);
        self.manager.ensure_model(&id).await?;
        Ok(self.backend_channel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::provider::MockModelProvider;
    use crate::cache::serving::{MockServingBackend, ModelVersionState};
    use crate::cache::{LruDiskCache, ModelArtifact};
    use crate::metrics::Metrics;

    fn manager_with_available_backend(dir: &std::path::Path) -> Arc<CacheManager> {
        let base = dir.to_path_buf();
        let mut provider = MockModelProvider::new();
        provider.expect_model_size().returning(|_, _| Ok(10));
        provider
            .expect_fetch_model()
            .returning(move |name, version, _| {
                let model_dir = base.join(name).join(version.to_string());
                std::fs::create_dir_all(&model_dir).unwrap();
                std::fs::write(model_dir.join("model.bin"), b"0123456789").unwrap();
                Ok(ModelArtifact {
                    id: ModelId::new(name, version),
                    path: format!("{}/{}", name, version),
                    size_bytes: 10,
                })
            });

        let mut serving = MockServingBackend::new();
        serving.expect_reload_config().returning(|_, _| Ok(()));
        serving
            .expect_model_status()
            .returning(|_| Ok(ModelVersionState::Available));

        Arc::new(CacheManager::new(
            LruDiskCache::new(dir, 1_000),
            Arc::new(provider),
            Arc::new(serving),
            "/models",
            1.0,
            2,
            Arc::new(Metrics::new(false)),
        ))
    }

    #[tokio::test]
    async fn direct_ensures_model_and_returns_backend() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_available_backend(dir.path());
        let director = WorkerDirector::new(
            manager.clone(),
            "http://localhost:8501/",
            "localhost:8500",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();

        let target = director.direct("foo", "1").await.unwrap();
        assert_eq!(target, "http://localhost:8501");
        assert_eq!(manager.list_models().await.len(), 1);
    }

    #[tokio::test]
    async fn channel_for_ensures_model_before_forwarding() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_available_backend(dir.path());
        let director = WorkerDirector::new(
            manager.clone(),
            "http://localhost:8501",
            "localhost:8500",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();

        director.channel_for("foo", 1).await.unwrap();
        assert_eq!(manager.list_models().await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_version_surfaces_before_any_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockModelProvider::new();
        let serving = MockServingBackend::new();
        let manager = Arc::new(CacheManager::new(
            LruDiskCache::new(dir.path(), 1_000),
            Arc::new(provider),
            Arc::new(serving),
            "/models",
            1.0,
            2,
            Arc::new(Metrics::new(false)),
        ));
        let director = WorkerDirector::new(
            manager,
            "http://localhost:8501",
            "localhost:8500",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();

        assert!(matches!(
            director.direct("foo", "not-a-version").await,
            Err(Error::InvalidVersion(_))
        ));
    }
}

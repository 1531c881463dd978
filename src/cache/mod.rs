//! Materialization cache and fetch-and-load state machine
//!
//! The cache role of a node: on every request for a (model, version), make
//! sure the artifact is on local disk and loaded in the serving backend
//! before the request is forwarded. Hits take a shared lock and run fully in
//! parallel; a miss takes the single writer lock and runs the whole
//! fetch → admit → reload → await-available pipeline while holding it, so at
//! most one fetch/reload sequence is in flight per node.

mod lru;
pub mod provider;
pub mod providers;
pub mod serving;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub use lru::LruDiskCache;
pub use provider::ModelProvider;
pub use serving::{ModelVersionState, ServingBackend, ServingController};

use crate::error::Error;
use crate::metrics::Metrics;

/// Poll interval of the await-available loop
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A versioned model name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelId {
    /// Model name
    pub name: String,
    /// Model version
    pub version: i64,
}

impl ModelId {
    /// Create a model id.
    pub fn new(name: impl Into<String>, version: i64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Parse a wire version string into an id. Leading zeros collapse into
    /// the canonical decimal form (`000000042` names version 42).
    pub fn parse(name: impl Into<String>, version: &str) -> Result<Self, Error> {
        let version = version
            .parse::<i64>()
            .map_err(|_| Error::InvalidVersion(version.to_string()))?;
        Ok(Self::new(name, version))
    }

    /// The consistent-hashing key for this id. The format is shared by all
    /// peers; changing it changes the ring.
    pub fn routing_key(&self) -> String {
        format!("{}##{}", self.name, self.version)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// A model artifact materialized on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    /// The model this artifact belongs to
    pub id: ModelId,
    /// Path relative to the cache root (`{name}/{version}`)
    pub path: String,
    /// Total size on disk in bytes
    pub size_bytes: u64,
}

/// The cache role of a node: materialization cache plus serving
/// reconciliation.
pub struct CacheManager {
    cache: RwLock<LruDiskCache>,
    provider: Arc<dyn ModelProvider>,
    serving: Arc<dyn ServingBackend>,
    /// Model base path as seen by the backend (container mounts may differ
    /// from the cache root on the host)
    serving_model_path: String,
    max_concurrent_models: usize,
    /// Max seconds to wait for AVAILABLE after a reload; zero means "probe
    /// once"
    model_fetch_timeout: f32,
    metrics: Arc<Metrics>,
}

impl CacheManager {
    /// Create a cache manager over the given cache, provider and backend.
    pub fn new(
        cache: LruDiskCache,
        provider: Arc<dyn ModelProvider>,
        serving: Arc<dyn ServingBackend>,
        serving_model_path: impl Into<String>,
        model_fetch_timeout: f32,
        max_concurrent_models: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache: RwLock::new(cache),
            provider,
            serving,
            serving_model_path: serving_model_path.into(),
            max_concurrent_models,
            model_fetch_timeout,
            metrics,
        }
    }

    /// Make sure the model is on disk and loaded in the backend.
    ///
    /// Hit: shared lock, backend state probe, done. Miss: exclusive lock,
    /// size → evict → fetch → admit → reload → await AVAILABLE. Cached but
    /// unloaded (backend reports UNLOADING/END or the status RPC fails):
    /// exclusive lock, reload without re-fetching.
    pub async fn ensure_model(&self, id: &ModelId) -> Result<(), Error> {
        info!(model = %id, "Handling model request");
        let series = self.metrics.cache_series(id);
        series.record_request();

        match self.try_get_from_cache(id).await {
            None => {
                series.record_miss();
                let started = Instant::now();
                let mut cache = self.cache.write().await;

                let size = self.provider.model_size(&id.name, id.version).await?;
                cache.ensure_free_bytes(size).await;
                let artifact = self
                    .provider
                    .fetch_model(&id.name, id.version, cache.base_dir())
                    .await?;
                cache.put(artifact).await;
                let result = self.reload_serving(&cache, id).await;
                series.record_fetch_time(started.elapsed());
                result
            }
            Some(_) => match self.serving.model_status(id).await {
                Err(_) | Ok(ModelVersionState::Unloading) | Ok(ModelVersionState::End) => {
                    // On disk but not loaded in the backend.
                    let cache = self.cache.write().await;
                    self.reload_serving(&cache, id).await
                }
                Ok(_) => {
                    series.record_hit();
                    Ok(())
                }
            },
        }
    }

    /// Cache lookup with the on-disk guarantee: present in the map and the
    /// artifact path still exists. A map entry whose files are gone degrades
    /// to a miss.
    async fn try_get_from_cache(&self, id: &ModelId) -> Option<ModelArtifact> {
        let cache = self.cache.read().await;
        let artifact = cache.get(id)?;
        let disk_path = cache.model_path(&artifact);
        drop(cache);

        match tokio::fs::try_exists(&disk_path).await {
            Ok(true) => Some(artifact),
            _ => {
                warn!(
                    model = %id,
                    path = %disk_path.display(),
                    "Model in cache but not present on disk"
                );
                None
            }
        }
    }

    /// Push the MRU prefix of the cache to the backend and wait for the
    /// requested model to become AVAILABLE.
    async fn reload_serving(&self, cache: &LruDiskCache, requested: &ModelId) -> Result<(), Error> {
        let models = cache.list_models();
        let active = models.len().min(self.max_concurrent_models);
        self.serving
            .reload_config(&models[..active], &self.serving_model_path)
            .await
            .map_err(|e| {
                error!(error = %e, "Error reloading serving config");
                e
            })?;

        // A zero timeout still issues one probe ("check once").
        let mut waited = 0.0f32;
        while waited == 0.0 || waited < self.model_fetch_timeout {
            match self.serving.model_status(requested).await {
                Ok(ModelVersionState::Available) => {
                    info!(model = %requested, "Model available");
                    return Ok(());
                }
                Ok(state) => {
                    debug!(
                        model = %requested,
                        state = state.as_str_name(),
                        waited,
                        "Model not yet available"
                    );
                }
                Err(e) => {
                    error!(error = %e, waited, "Error getting model status");
                }
            }
            waited += 0.5;
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
        Err(Error::LoadTimeout)
    }

    /// Artifacts currently admitted, most recently used first.
    pub async fn list_models(&self) -> Vec<ModelArtifact> {
        self.cache.read().await.list_models()
    }

    /// Node health: provider reachable and the backend answering status RPCs.
    pub async fn is_healthy(&self) -> bool {
        self.provider.check() && self.serving.model_states().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::provider::MockModelProvider;
    use super::serving::MockServingBackend;
    use super::*;
    use mockall::predicate;

    fn artifact_for(dir: &std::path::Path, name: &str, version: i64, size: u64) -> ModelArtifact {
        let model_dir = dir.join(name).join(version.to_string());
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("model.bin"), vec![0u8; size as usize]).unwrap();
        ModelArtifact {
            id: ModelId::new(name, version),
            path: format!("{}/{}", name, version),
            size_bytes: size,
        }
    }

    fn manager(
        dir: &std::path::Path,
        provider: MockModelProvider,
        serving: MockServingBackend,
        timeout: f32,
    ) -> CacheManager {
        CacheManager::new(
            LruDiskCache::new(dir, 1_000),
            Arc::new(provider),
            Arc::new(serving),
            "/models",
            timeout,
            2,
            Arc::new(Metrics::new(false)),
        )
    }

    #[tokio::test]
    async fn miss_fetches_reloads_and_waits_for_available() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();

        let mut provider = MockModelProvider::new();
        provider
            .expect_model_size()
            .with(predicate::eq("foo"), predicate::eq(1))
            .times(1)
            .returning(|_, _| Ok(10));
        let fetch_base = base.clone();
        provider
            .expect_fetch_model()
            .times(1)
            .returning(move |name, version, _| {
                Ok(artifact_for(&fetch_base, name, version, 10))
            });

        let mut serving = MockServingBackend::new();
        serving
            .expect_reload_config()
            .withf(|models, base_path| {
                base_path == "/models"
                    && models.iter().any(|m| m.id == ModelId::new("foo", 1))
            })
            .times(1)
            .returning(|_, _| Ok(()));
        serving
            .expect_model_status()
            .returning(|_| Ok(ModelVersionState::Available));

        let manager = manager(&base, provider, serving, 1.0);
        manager.ensure_model(&ModelId::new("foo", 1)).await.unwrap();

        let models = manager.list_models().await;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, ModelId::new("foo", 1));
    }

    #[tokio::test]
    async fn hit_with_available_backend_skips_reload() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_for(dir.path(), "foo", 1, 10);

        let provider = MockModelProvider::new();
        let mut serving = MockServingBackend::new();
        serving
            .expect_model_status()
            .times(1)
            .returning(|_| Ok(ModelVersionState::Available));
        // No reload_config expectation: a call would panic the mock.

        let manager = manager(dir.path(), provider, serving, 1.0);
        manager.cache.write().await.put(artifact).await;

        manager.ensure_model(&ModelId::new("foo", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn cached_but_unloaded_reloads_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_for(dir.path(), "foo", 1, 10);

        let provider = MockModelProvider::new();
        let mut serving = MockServingBackend::new();
        let mut seq = mockall::Sequence::new();
        serving
            .expect_model_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ModelVersionState::End));
        serving
            .expect_reload_config()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        serving
            .expect_model_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ModelVersionState::Available));

        let manager = manager(dir.path(), provider, serving, 1.0);
        manager.cache.write().await.put(artifact).await;

        manager.ensure_model(&ModelId::new("foo", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn entry_missing_on_disk_degrades_to_miss() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        // Cache entry whose files were removed out of band.
        let stale = ModelArtifact {
            id: ModelId::new("foo", 1),
            path: "foo/1".to_string(),
            size_bytes: 10,
        };

        let mut provider = MockModelProvider::new();
        provider.expect_model_size().returning(|_, _| Ok(10));
        let fetch_base = base.clone();
        provider
            .expect_fetch_model()
            .times(1)
            .returning(move |name, version, _| {
                Ok(artifact_for(&fetch_base, name, version, 10))
            });

        let mut serving = MockServingBackend::new();
        serving.expect_reload_config().returning(|_, _| Ok(()));
        serving
            .expect_model_status()
            .returning(|_| Ok(ModelVersionState::Available));

        let manager = manager(&base, provider, serving, 1.0);
        manager.cache.write().await.put(stale).await;

        manager.ensure_model(&ModelId::new("foo", 1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_loading_times_out_after_two_probes() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();

        let mut provider = MockModelProvider::new();
        provider.expect_model_size().returning(|_, _| Ok(10));
        let fetch_base = base.clone();
        provider
            .expect_fetch_model()
            .returning(move |name, version, _| {
                Ok(artifact_for(&fetch_base, name, version, 10))
            });

        let mut serving = MockServingBackend::new();
        serving.expect_reload_config().returning(|_, _| Ok(()));
        // With a 1.0 s budget the loop probes at 0.0 s and 0.5 s, then stops.
        serving
            .expect_model_status()
            .times(2)
            .returning(|_| Ok(ModelVersionState::Loading));

        let manager = manager(&base, provider, serving, 1.0);
        let err = manager
            .ensure_model(&ModelId::new("foo", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LoadTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_still_probes_once() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();

        let mut provider = MockModelProvider::new();
        provider.expect_model_size().returning(|_, _| Ok(10));
        let fetch_base = base.clone();
        provider
            .expect_fetch_model()
            .returning(move |name, version, _| {
                Ok(artifact_for(&fetch_base, name, version, 10))
            });

        let mut serving = MockServingBackend::new();
        serving.expect_reload_config().returning(|_, _| Ok(()));
        serving
            .expect_model_status()
            .times(1)
            .returning(|_| Ok(ModelVersionState::Available));

        let manager = manager(&base, provider, serving, 0.0);
        manager.ensure_model(&ModelId::new("foo", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn reload_failure_keeps_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();

        let mut provider = MockModelProvider::new();
        provider.expect_model_size().returning(|_, _| Ok(10));
        let fetch_base = base.clone();
        provider
            .expect_fetch_model()
            .returning(move |name, version, _| {
                Ok(artifact_for(&fetch_base, name, version, 10))
            });

        let mut serving = MockServingBackend::new();
        serving
            .expect_reload_config()
            .returning(|_, _| Err(Error::Reload("backend refused".into())));

        let manager = manager(&base, provider, serving, 1.0);
        let err = manager
            .ensure_model(&ModelId::new("foo", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Reload(_)));

        // The artifact stays admitted; the next request may succeed.
        assert_eq!(manager.list_models().await.len(), 1);
    }

    #[test]
    fn routing_key_is_name_hash_hash_version() {
        assert_eq!(ModelId::new("foo", 42).routing_key(), "foo##42");
    }

    #[test]
    fn version_strings_parse_to_canonical_form() {
        let id = ModelId::parse("foo", "000000042").unwrap();
        assert_eq!(id, ModelId::new("foo", 42));
        assert_eq!(id.routing_key(), "foo##42");
        assert!(ModelId::parse("foo", "not-a-number").is_err());
    }
}

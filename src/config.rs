//! Configuration loading
//!
//! Settings come from a single YAML file. Every key has a default so a minimal
//! config only needs the model provider section. Key names follow the flat
//! camelCase map documented in the README (`modelCache.hostModelPath`,
//! `serving.grpcHost`, ...).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Top-level settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Listen port for the cache-role REST service
    #[serde(default = "default_cache_rest_port")]
    pub cache_rest_port: u16,
    /// Listen port for the cache-role gRPC service
    #[serde(default = "default_cache_grpc_port")]
    pub cache_grpc_port: u16,
    /// Listen port for the proxy-role REST service
    #[serde(default = "default_proxy_rest_port")]
    pub proxy_rest_port: u16,
    /// Listen port for the proxy-role gRPC service
    #[serde(default = "default_proxy_grpc_port")]
    pub proxy_grpc_port: u16,

    /// Materialization cache settings
    #[serde(default)]
    pub model_cache: ModelCacheSettings,
    /// Downstream serving backend settings
    #[serde(default)]
    pub serving: ServingSettings,
    /// Proxy-role settings
    #[serde(default)]
    pub proxy: ProxySettings,
    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsSettings,
    /// Health probe settings
    #[serde(default)]
    pub healthprobe: HealthProbeSettings,
    /// Service discovery settings; absent disables the proxy role
    #[serde(default)]
    pub service_discovery: Option<DiscoverySettings>,
    /// Model provider settings
    pub model_provider: ProviderSettings,
}

/// Materialization cache settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCacheSettings {
    /// Cache root directory on the host
    #[serde(default = "default_host_model_path")]
    pub host_model_path: PathBuf,
    /// Capacity in bytes
    #[serde(default = "default_cache_size")]
    pub size: u64,
}

impl Default for ModelCacheSettings {
    fn default() -> Self {
        Self {
            host_model_path: default_host_model_path(),
            size: default_cache_size(),
        }
    }
}

/// Downstream serving backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServingSettings {
    /// Model base path as seen by the backend (may differ from
    /// `modelCache.hostModelPath` due to container mounts)
    #[serde(default = "default_serving_model_path")]
    pub serving_model_path: String,
    /// Backend gRPC endpoint (`host:port`)
    #[serde(default = "default_serving_grpc_host")]
    pub grpc_host: String,
    /// Backend REST endpoint (full URL)
    #[serde(default = "default_serving_rest_host")]
    pub rest_host: String,
    /// Working-set bound: max models loaded in the backend at once
    #[serde(default = "default_max_concurrent_models")]
    pub max_concurrent_models: usize,
    /// gRPC message size cap in bytes
    #[serde(default = "default_grpc_max_msg_size")]
    pub grpc_max_msg_size: usize,
    /// Timeout for config/status RPCs, in seconds
    #[serde(default = "default_grpc_config_timeout")]
    pub grpc_config_timeout: u64,
    /// Timeout for forwarded inference RPCs, in seconds
    #[serde(default = "default_grpc_predict_timeout")]
    pub grpc_predict_timeout: u64,
    /// Max time to wait for a fetched model to become AVAILABLE, in seconds
    /// (fractional). Zero means "probe once".
    #[serde(default = "default_model_fetch_timeout")]
    pub model_fetch_timeout: f32,
    /// Metrics path on the backend REST endpoint, when it differs from
    /// `metrics.path`
    #[serde(default)]
    pub metrics_path: Option<String>,
}

impl Default for ServingSettings {
    fn default() -> Self {
        Self {
            serving_model_path: default_serving_model_path(),
            grpc_host: default_serving_grpc_host(),
            rest_host: default_serving_rest_host(),
            max_concurrent_models: default_max_concurrent_models(),
            grpc_max_msg_size: default_grpc_max_msg_size(),
            grpc_config_timeout: default_grpc_config_timeout(),
            grpc_predict_timeout: default_grpc_predict_timeout(),
            model_fetch_timeout: default_model_fetch_timeout(),
            metrics_path: None,
        }
    }
}

/// Proxy-role settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    /// Replication factor R: how many replicas own each model key (min 1)
    #[serde(default = "default_replicas_per_model")]
    pub replicas_per_model: usize,
    /// Timeout for forwarding to peer replicas, in seconds
    #[serde(default = "default_proxy_grpc_timeout")]
    pub grpc_timeout: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            replicas_per_model: default_replicas_per_model(),
            grpc_timeout: default_proxy_grpc_timeout(),
        }
    }
}

/// Metrics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSettings {
    /// Per-(model, version) counter labels when true; one global series otherwise
    #[serde(default)]
    pub model_labels: bool,
    /// Metrics path on the proxy REST listener
    #[serde(default = "default_metrics_path")]
    pub path: String,
    /// Timeout when scraping the backend's metrics page, in seconds
    #[serde(default = "default_metrics_timeout")]
    pub timeout: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            model_labels: false,
            path: default_metrics_path(),
            timeout: default_metrics_timeout(),
        }
    }
}

/// Health probe settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthProbeSettings {
    /// Model whose status-RPC failures are logged quietly (probe noise)
    #[serde(default)]
    pub model_name: String,
}

/// Service discovery backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    /// Consul agent with a TTL health check
    Consul,
    /// etcd with lease-scoped registration keys
    Etcd,
    /// Kubernetes Endpoints watch
    K8s,
}

/// Service discovery settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverySettings {
    /// Which backend to use
    #[serde(rename = "type")]
    pub kind: DiscoveryKind,
    /// Logical service name shared by all peers
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Stable instance id; defaults to the service name (consul) or a random
    /// id (etcd)
    #[serde(default)]
    pub service_id: Option<String>,
    /// Registration TTL in seconds; refreshed at half this interval
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl: u64,
    /// Backend endpoints (consul/etcd)
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Optional backend credentials (etcd)
    #[serde(default)]
    pub authorization: Option<AuthSettings>,
    /// Advertise 127.0.0.1 when no outbound interface is available
    #[serde(default)]
    pub allow_localhost: bool,
    /// Kubernetes-specific settings
    #[serde(default)]
    pub k8s: K8sDiscoverySettings,
}

/// Backend credentials
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

/// Kubernetes discovery settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sDiscoverySettings {
    /// Field selector identifying the peer Endpoints object
    #[serde(default)]
    pub field_selector: HashMap<String, String>,
    /// Port names in the service definition
    #[serde(default)]
    pub port_names: K8sPortNames,
    /// Namespace override; defaults to the pod's own namespace
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Port names in the Kubernetes service definition
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sPortNames {
    /// Name of the gRPC cache port
    #[serde(default = "default_grpc_cache_port_name")]
    pub grpc_cache: String,
    /// Name of the REST cache port
    #[serde(default = "default_http_cache_port_name")]
    pub http_cache: String,
}

impl Default for K8sPortNames {
    fn default() -> Self {
        Self {
            grpc_cache: default_grpc_cache_port_name(),
            http_cache: default_http_cache_port_name(),
        }
    }
}

/// Model provider selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ProviderKind {
    /// Local directory repository
    #[serde(rename = "diskProvider")]
    Disk,
    /// HTTP model repository (manifest + blobs)
    #[serde(rename = "httpProvider")]
    Http,
}

/// Model provider settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    /// Which provider to use
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Disk provider settings
    #[serde(default)]
    pub disk_provider: Option<DiskProviderSettings>,
    /// HTTP provider settings
    #[serde(default)]
    pub http: Option<HttpProviderSettings>,
}

/// Disk provider settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskProviderSettings {
    /// Repository root: models live under `{baseDir}/{name}/{version}/`
    pub base_dir: PathBuf,
}

/// HTTP provider settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpProviderSettings {
    /// Repository base URL: manifests live at
    /// `{baseUrl}/{name}/{version}/manifest.json`
    pub base_url: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_http_provider_timeout")]
    pub timeout: u64,
}

impl Settings {
    /// Load settings from a YAML file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let settings: Settings = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), Error> {
        match self.model_provider.kind {
            ProviderKind::Disk if self.model_provider.disk_provider.is_none() => Err(
                Error::Config("modelProvider.diskProvider section is required".into()),
            ),
            ProviderKind::Http if self.model_provider.http.is_none() => Err(Error::Config(
                "modelProvider.http section is required".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Effective replication factor (minimum 1)
    pub fn replicas_per_model(&self) -> usize {
        self.proxy.replicas_per_model.max(1)
    }

    /// Timeout for backend config/status RPCs
    pub fn grpc_config_timeout(&self) -> Duration {
        Duration::from_secs(self.serving.grpc_config_timeout)
    }

    /// Timeout for forwarded inference RPCs to the backend
    pub fn grpc_predict_timeout(&self) -> Duration {
        Duration::from_secs(self.serving.grpc_predict_timeout)
    }

    /// Timeout for forwarding to peer replicas
    pub fn proxy_grpc_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.grpc_timeout)
    }

    /// Metrics path on the backend, falling back to the proxy metrics path
    pub fn serving_metrics_path(&self) -> &str {
        self.serving
            .metrics_path
            .as_deref()
            .unwrap_or(&self.metrics.path)
    }
}

fn default_cache_rest_port() -> u16 {
    8091
}
fn default_cache_grpc_port() -> u16 {
    8092
}
fn default_proxy_rest_port() -> u16 {
    8081
}
fn default_proxy_grpc_port() -> u16 {
    8082
}
fn default_host_model_path() -> PathBuf {
    PathBuf::from("./models")
}
fn default_cache_size() -> u64 {
    1_000_000_000
}
fn default_serving_model_path() -> String {
    "/models".to_string()
}
fn default_serving_grpc_host() -> String {
    "localhost:8500".to_string()
}
fn default_serving_rest_host() -> String {
    "http://localhost:8501".to_string()
}
fn default_max_concurrent_models() -> usize {
    2
}
fn default_grpc_max_msg_size() -> usize {
    16 * 1024 * 1024
}
fn default_grpc_config_timeout() -> u64 {
    10
}
fn default_grpc_predict_timeout() -> u64 {
    30
}
fn default_model_fetch_timeout() -> f32 {
    10.0
}
fn default_replicas_per_model() -> usize {
    1
}
fn default_proxy_grpc_timeout() -> u64 {
    10
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}
fn default_metrics_timeout() -> u64 {
    5
}
fn default_service_name() -> String {
    "mantle".to_string()
}
fn default_heartbeat_ttl() -> u64 {
    10
}
fn default_grpc_cache_port_name() -> String {
    "grpccache".to_string()
}
fn default_http_cache_port_name() -> String {
    "httpcache".to_string()
}
fn default_http_provider_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let yaml = r#"
modelProvider:
  type: diskProvider
  diskProvider:
    baseDir: /srv/model_repo
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.cache_rest_port, 8091);
        assert_eq!(settings.model_cache.size, 1_000_000_000);
        assert_eq!(settings.serving.grpc_host, "localhost:8500");
        assert_eq!(settings.serving.grpc_max_msg_size, 16 * 1024 * 1024);
        assert_eq!(settings.replicas_per_model(), 1);
        assert!(settings.service_discovery.is_none());
        assert_eq!(settings.model_provider.kind, ProviderKind::Disk);
    }

    #[test]
    fn full_config_parses() {
        let yaml = r#"
cacheRestPort: 9001
cacheGrpcPort: 9002
proxyRestPort: 9003
proxyGrpcPort: 9004
modelCache:
  hostModelPath: /var/cache/models
  size: 123456
serving:
  servingModelPath: /models
  grpcHost: tfserving:8500
  restHost: http://tfserving:8501
  maxConcurrentModels: 4
  grpcConfigTimeout: 20
  modelFetchTimeout: 2.5
proxy:
  replicasPerModel: 3
  grpcTimeout: 15
metrics:
  modelLabels: true
  path: /metrics
  timeout: 3
healthprobe:
  modelName: canary
serviceDiscovery:
  type: etcd
  serviceName: mantle
  heartbeatTTL: 10
  endpoints: ["http://etcd:2379"]
  authorization:
    username: svc
    password: hunter2
modelProvider:
  type: httpProvider
  http:
    baseUrl: http://model-repo:8080
    timeout: 60
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.proxy_rest_port, 9003);
        assert_eq!(settings.serving.max_concurrent_models, 4);
        assert_eq!(settings.serving.model_fetch_timeout, 2.5);
        assert_eq!(settings.replicas_per_model(), 3);
        assert!(settings.metrics.model_labels);
        assert_eq!(settings.healthprobe.model_name, "canary");
        let disc = settings.service_discovery.as_ref().unwrap();
        assert_eq!(disc.kind, DiscoveryKind::Etcd);
        assert_eq!(disc.endpoints, vec!["http://etcd:2379"]);
        assert_eq!(settings.model_provider.kind, ProviderKind::Http);
    }

    #[test]
    fn replicas_floor_is_one() {
        let yaml = r#"
proxy:
  replicasPerModel: 0
modelProvider:
  type: diskProvider
  diskProvider:
    baseDir: /repo
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.replicas_per_model(), 1);
    }

    #[test]
    fn provider_sections_are_cross_checked() {
        let yaml = r#"
modelProvider:
  type: httpProvider
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert!(settings.validate().is_err());
    }
}

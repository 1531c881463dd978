//! Mantle daemon - collocated proxy and cache roles

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mantle::cache::providers::{DiskModelProvider, HttpModelProvider};
use mantle::cache::{CacheManager, LruDiskCache, ModelProvider, ServingController};
use mantle::cluster::discovery::{
    ConsulDiscovery, DiscoveryBackend, EtcdDiscovery, KubernetesDiscovery,
};
use mantle::cluster::{outbound_ip, ClusterConnection, Member};
use mantle::config::{DiscoveryKind, ProviderKind, Settings};
use mantle::metrics::{metrics_handler, Metrics, MetricsState};
use mantle::proxy::{ChannelPool, GrpcProxy, HealthFlag, HealthService, RestProxy};
use mantle::router::ShardRouter;
use mantle::worker::WorkerDirector;

/// Interval of the periodic health probe
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Dial timeout for peer replica channels
const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Mantle - sharded caching proxy for a model-serving backend
#[derive(Parser, Debug)]
#[command(name = "mantle", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, short, env = "MANTLE_CONFIG", default_value = "mantle.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    let metrics = Arc::new(Metrics::new(settings.metrics.model_labels));
    let health = HealthFlag::new();

    // Cache role: provider + cache + serving controller + worker director.
    let provider = build_provider(&settings)?;
    tokio::fs::create_dir_all(&settings.model_cache.host_model_path).await?;
    let cache = LruDiskCache::new(
        settings.model_cache.host_model_path.clone(),
        settings.model_cache.size,
    );
    let serving = Arc::new(ServingController::connect(
        &settings.serving.grpc_host,
        settings.grpc_config_timeout(),
        settings.serving.grpc_max_msg_size,
        settings.healthprobe.model_name.clone(),
    )?);
    let manager = Arc::new(CacheManager::new(
        cache,
        provider,
        serving,
        settings.serving.serving_model_path.clone(),
        settings.serving.model_fetch_timeout,
        settings.serving.max_concurrent_models,
        metrics.clone(),
    ));
    let worker = Arc::new(WorkerDirector::new(
        manager.clone(),
        &settings.serving.rest_host,
        &settings.serving.grpc_host,
        settings.grpc_config_timeout(),
        settings.grpc_predict_timeout(),
    )?);

    let cache_rest_addr = listen_addr(settings.cache_rest_port);
    let cache_rest = RestProxy::new(worker.clone(), metrics.clone()).into_router();
    tokio::spawn(serve_rest(cache_rest_addr, cache_rest));
    tracing::info!(addr = %cache_rest_addr, "Cache REST listener started");

    let cache_grpc_addr = listen_addr(settings.cache_grpc_port);
    let cache_grpc = GrpcProxy::new(
        worker.clone(),
        metrics.clone(),
        settings.serving.grpc_max_msg_size,
    );
    let cache_health = HealthService::new(&health);
    tokio::spawn(async move {
        if let Err(e) = cache_grpc.serve(cache_grpc_addr, cache_health).await {
            tracing::error!(error = %e, "Cache gRPC server error");
        }
    });
    tracing::info!(addr = %cache_grpc_addr, "Cache gRPC listener started");

    // Proxy role, enabled by configuring service discovery.
    let proxy_role = match &settings.service_discovery {
        Some(discovery_settings) => {
            let advertised = Member {
                host: outbound_ip(discovery_settings.allow_localhost)?.to_string(),
                rest_port: settings.cache_rest_port,
                grpc_port: settings.cache_grpc_port,
            };
            tracing::info!(member = %advertised, "Advertising this node");

            let discovery = build_discovery(&settings, advertised, health.clone()).await?;
            let cluster = Arc::new(ClusterConnection::new(
                discovery,
                settings.replicas_per_model(),
            ));
            cluster.connect().await?;

            let pool = Arc::new(ChannelPool::new(
                PEER_CONNECT_TIMEOUT,
                settings.proxy_grpc_timeout(),
            ));
            let router = Arc::new(ShardRouter::new(cluster.clone(), pool.clone()));

            let proxy_rest_addr = listen_addr(settings.proxy_rest_port);
            let proxy_rest = RestProxy::new(router.clone(), metrics.clone())
                .into_router()
                .merge(metrics_router(&settings, metrics.clone()));
            tokio::spawn(serve_rest(proxy_rest_addr, proxy_rest));
            tracing::info!(addr = %proxy_rest_addr, "Proxy REST listener started");

            let proxy_grpc_addr = listen_addr(settings.proxy_grpc_port);
            let proxy_grpc = GrpcProxy::new(
                router,
                metrics.clone(),
                settings.serving.grpc_max_msg_size,
            );
            let proxy_health = HealthService::new(&health);
            tokio::spawn(async move {
                if let Err(e) = proxy_grpc.serve(proxy_grpc_addr, proxy_health).await {
                    tracing::error!(error = %e, "Proxy gRPC server error");
                }
            });
            tracing::info!(addr = %proxy_grpc_addr, "Proxy gRPC listener started");

            Some((cluster, pool))
        }
        None => {
            tracing::info!("Proxy is disabled (no service discovery configured)");
            let proxy_rest_addr = listen_addr(settings.proxy_rest_port);
            tokio::spawn(serve_rest(
                proxy_rest_addr,
                metrics_router(&settings, metrics.clone()),
            ));
            tracing::info!(addr = %proxy_rest_addr, path = %settings.metrics.path, "Metrics listener started");
            None
        }
    };

    // Periodic health probe feeding the gRPC health services and the
    // discovery TTL refresh.
    let probe_manager = manager.clone();
    let probe_flag = health.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_PROBE_INTERVAL);
        loop {
            ticker.tick().await;
            let healthy = probe_manager.is_healthy().await;
            probe_flag.set(healthy);
            tracing::debug!(healthy, "Health probe");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    if let Some((cluster, pool)) = proxy_role {
        if let Err(e) = cluster.disconnect().await {
            tracing::error!(error = %e, "Error disconnecting from cluster");
        }
        pool.clear().await;
    }
    Ok(())
}

fn listen_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

async fn serve_rest(addr: SocketAddr, router: Router) {
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, addr = %addr, "REST server error");
            }
        }
        Err(e) => tracing::error!(error = %e, addr = %addr, "Cannot bind REST listener"),
    }
}

fn metrics_router(settings: &Settings, metrics: Arc<Metrics>) -> Router {
    let backend_url = format!(
        "{}{}",
        settings.serving.rest_host.trim_end_matches('/'),
        settings.serving_metrics_path()
    );
    let state = MetricsState {
        metrics,
        client: reqwest::Client::new(),
        backend_url,
        timeout: Duration::from_secs(settings.metrics.timeout),
    };
    Router::new().route(
        &settings.metrics.path,
        get(metrics_handler).with_state(state),
    )
}

fn build_provider(settings: &Settings) -> anyhow::Result<Arc<dyn ModelProvider>> {
    match settings.model_provider.kind {
        ProviderKind::Disk => {
            let disk = settings
                .model_provider
                .disk_provider
                .as_ref()
                .expect("validated at load");
            Ok(Arc::new(DiskModelProvider::new(disk.base_dir.clone())))
        }
        ProviderKind::Http => {
            let http = settings
                .model_provider
                .http
                .as_ref()
                .expect("validated at load");
            Ok(Arc::new(HttpModelProvider::new(
                http.base_url.clone(),
                Duration::from_secs(http.timeout),
            )?))
        }
    }
}

async fn build_discovery(
    settings: &Settings,
    advertised: Member,
    health: HealthFlag,
) -> anyhow::Result<Arc<dyn DiscoveryBackend>> {
    let discovery = settings
        .service_discovery
        .as_ref()
        .expect("caller checked discovery is configured");
    let ttl = Duration::from_secs(discovery.heartbeat_ttl.max(1));

    match discovery.kind {
        DiscoveryKind::Consul => {
            let base_url = discovery
                .endpoints
                .first()
                .cloned()
                .unwrap_or_else(|| "http://127.0.0.1:8500".to_string());
            Ok(Arc::new(ConsulDiscovery::new(
                base_url,
                discovery.service_name.clone(),
                discovery.service_id.clone(),
                ttl,
                advertised,
                health,
            )))
        }
        DiscoveryKind::Etcd => {
            let credentials = discovery
                .authorization
                .as_ref()
                .map(|auth| (auth.username.clone(), auth.password.clone()));
            Ok(Arc::new(
                EtcdDiscovery::connect(
                    &discovery.endpoints,
                    credentials,
                    &discovery.service_name,
                    discovery.service_id.clone(),
                    ttl,
                    advertised,
                    health,
                )
                .await?,
            ))
        }
        DiscoveryKind::K8s => Ok(Arc::new(KubernetesDiscovery::new(&discovery.k8s).await?)),
    }
}

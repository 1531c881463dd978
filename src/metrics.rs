//! Request and cache metrics
//!
//! Plain atomic counters, rendered as Prometheus-style text on the proxy
//! REST listener. Cache counters are either a single global series or one
//! series per (model, version) when `metrics.modelLabels` is set. The
//! metrics page also scrapes the backend's own metrics endpoint and appends
//! it, so one scrape covers the whole node.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use tracing::warn;

use crate::cache::ModelId;

/// Per-protocol proxy counters
#[derive(Debug, Default)]
pub struct ProtocolSeries {
    /// Total requests handled
    pub requests: AtomicU64,
    /// Requests that failed before or during forwarding
    pub failures: AtomicU64,
}

impl ProtocolSeries {
    /// Count a request
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failure
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Cache counters for one label set
#[derive(Debug, Default)]
pub struct CacheSeries {
    /// Cache lookups, hits and misses combined
    pub requests: AtomicU64,
    /// Lookups answered from the local cache
    pub hits: AtomicU64,
    /// Lookups that required a provider fetch
    pub misses: AtomicU64,
    /// Total time spent fetching on misses, in microseconds
    pub fetch_micros: AtomicU64,
}

impl CacheSeries {
    /// Count a lookup
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a hit
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a miss
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Add fetch wall time for a miss
    pub fn record_fetch_time(&self, elapsed: Duration) {
        self.fetch_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Node-wide metrics registry
pub struct Metrics {
    /// REST proxy counters
    pub rest: ProtocolSeries,
    /// gRPC proxy counters
    pub grpc: ProtocolSeries,
    model_labels: bool,
    global: Arc<CacheSeries>,
    per_model: RwLock<HashMap<ModelId, Arc<CacheSeries>>>,
}

impl Metrics {
    /// Create a registry. With `model_labels` set, cache counters get one
    /// series per (model, version); otherwise a single global series.
    pub fn new(model_labels: bool) -> Self {
        Self {
            rest: ProtocolSeries::default(),
            grpc: ProtocolSeries::default(),
            model_labels,
            global: Arc::new(CacheSeries::default()),
            per_model: RwLock::new(HashMap::new()),
        }
    }

    /// The cache series for a model (or the global one).
    pub fn cache_series(&self, id: &ModelId) -> Arc<CacheSeries> {
        if !self.model_labels {
            return self.global.clone();
        }
        if let Some(series) = self.per_model.read().get(id) {
            return series.clone();
        }
        let mut per_model = self.per_model.write();
        per_model
            .entry(id.clone())
            .or_insert_with(|| Arc::new(CacheSeries::default()))
            .clone()
    }

    /// Render all counters as Prometheus text format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "mantle_proxy_requests_total{{protocol=\"rest\"}} {}",
            self.rest.requests.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "mantle_proxy_failures_total{{protocol=\"rest\"}} {}",
            self.rest.failures.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "mantle_proxy_requests_total{{protocol=\"grpc\"}} {}",
            self.grpc.requests.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "mantle_proxy_failures_total{{protocol=\"grpc\"}} {}",
            self.grpc.failures.load(Ordering::Relaxed)
        );

        if self.model_labels {
            let per_model = self.per_model.read();
            let mut ids: Vec<&ModelId> = per_model.keys().collect();
            ids.sort_by(|a, b| (&a.name, a.version).cmp(&(&b.name, b.version)));
            for id in ids {
                if let Some(series) = per_model.get(id) {
                    render_cache_series(&mut out, &id.name, &id.version.to_string(), series);
                }
            }
        } else {
            render_cache_series(&mut out, "all_models", "-1", &self.global);
        }

        out
    }
}

fn render_cache_series(out: &mut String, model: &str, version: &str, series: &CacheSeries) {
    let labels = format!("model=\"{}\",version=\"{}\"", model, version);
    let _ = writeln!(
        out,
        "mantle_cache_requests_total{{{}}} {}",
        labels,
        series.requests.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        out,
        "mantle_cache_hits_total{{{}}} {}",
        labels,
        series.hits.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        out,
        "mantle_cache_misses_total{{{}}} {}",
        labels,
        series.misses.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        out,
        "mantle_cache_fetch_duration_us_total{{{}}} {}",
        labels,
        series.fetch_micros.load(Ordering::Relaxed)
    );
}

/// State of the metrics endpoint: own counters plus the backend scrape
/// target.
#[derive(Clone)]
pub struct MetricsState {
    /// Registry rendered into the page
    pub metrics: Arc<Metrics>,
    /// HTTP client for the backend scrape
    pub client: reqwest::Client,
    /// Full URL of the backend's metrics page
    pub backend_url: String,
    /// Scrape timeout
    pub timeout: Duration,
}

/// Serve the node's metrics, merged with the backend's scraped page.
pub async fn metrics_handler(State(state): State<MetricsState>) -> Response {
    let mut body = state.metrics.render();

    match state
        .client
        .get(&state.backend_url)
        .timeout(state.timeout)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            if let Ok(text) = response.text().await {
                body.push_str(&text);
            }
        }
        Ok(response) => {
            warn!(status = %response.status(), url = %state.backend_url, "Backend metrics scrape failed");
        }
        Err(e) => {
            warn!(error = %e, url = %state.backend_url, "Backend metrics scrape failed");
        }
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_series_renders_all_models_labels() {
        let metrics = Metrics::new(false);
        let series = metrics.cache_series(&ModelId::new("foo", 1));
        series.record_request();
        series.record_hit();

        let text = metrics.render();
        assert!(text.contains("mantle_cache_requests_total{model=\"all_models\",version=\"-1\"} 1"));
        assert!(text.contains("mantle_cache_hits_total{model=\"all_models\",version=\"-1\"} 1"));
    }

    #[test]
    fn model_labels_split_series_per_version() {
        let metrics = Metrics::new(true);
        metrics.cache_series(&ModelId::new("foo", 1)).record_miss();
        metrics.cache_series(&ModelId::new("foo", 2)).record_hit();

        let text = metrics.render();
        assert!(text.contains("mantle_cache_misses_total{model=\"foo\",version=\"1\"} 1"));
        assert!(text.contains("mantle_cache_hits_total{model=\"foo\",version=\"2\"} 1"));
    }

    #[test]
    fn same_id_reuses_the_series() {
        let metrics = Metrics::new(true);
        metrics.cache_series(&ModelId::new("foo", 1)).record_hit();
        metrics.cache_series(&ModelId::new("foo", 1)).record_hit();
        assert_eq!(
            metrics
                .cache_series(&ModelId::new("foo", 1))
                .hits
                .load(Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn protocol_counters_render() {
        let metrics = Metrics::new(false);
        metrics.rest.record_request();
        metrics.rest.record_failure();
        metrics.grpc.record_request();

        let text = metrics.render();
        assert!(text.contains("mantle_proxy_requests_total{protocol=\"rest\"} 1"));
        assert!(text.contains("mantle_proxy_failures_total{protocol=\"rest\"} 1"));
        assert!(text.contains("mantle_proxy_requests_total{protocol=\"grpc\"} 1"));
    }
}

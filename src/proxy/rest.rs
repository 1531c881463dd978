//! REST reverse proxy
//!
//! Parses `(model, version)` from the inbound URL, asks a director for the
//! target base URL, then streams the request through unchanged and the
//! response back untouched. Path grammar and error bodies are part of the
//! external contract:
//!
//! - path mismatch → `404 {"Status":"Error","Message":"Not found"}`
//! - missing version → `400 {"Status":"Error","Message":"Model version must
//!   be provided"}`

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request};
use axum::response::{IntoResponse, Response};
use axum::Router;
use regex::Regex;
use tracing::{debug, error, info};

use crate::error::Error;
use crate::metrics::Metrics;

/// Path grammar shared by the proxy and cache roles
const MODEL_URL_PATTERN: &str = r"(?i)^/v1/models/(?P<name>[^/]+)(/versions/(?P<version>[0-9]+))?";

/// Picks the forwarding target for a parsed (model, version).
///
/// The proxy role resolves an owning replica; the cache role materializes
/// the model locally and returns the backend address.
#[async_trait]
pub trait RestDirector: Send + Sync {
    /// Base URL (`http://host:port`) to forward this request to.
    async fn direct(&self, model_name: &str, version: &str) -> Result<String, Error>;
}

/// Reverse proxy for the model REST surface.
pub struct RestProxy {
    director: Arc<dyn RestDirector>,
    client: reqwest::Client,
    pattern: Regex,
    metrics: Arc<Metrics>,
}

impl RestProxy {
    /// Create a proxy handing parsed requests to `director`.
    pub fn new(director: Arc<dyn RestDirector>, metrics: Arc<Metrics>) -> Self {
        Self {
            director,
            client: reqwest::Client::new(),
            pattern: Regex::new(MODEL_URL_PATTERN).expect("model URL pattern is valid"),
            metrics,
        }
    }

    /// An axum router serving the proxy on every path and method.
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(Self::handle)
            .with_state(Arc::new(self))
    }

    async fn handle(State(proxy): State<Arc<RestProxy>>, request: Request<Body>) -> Response {
        proxy.metrics.rest.record_request();
        let path = request.uri().path().to_string();
        debug!(path = %path, "Handling URL");

        let Some(captures) = proxy.pattern.captures(&path) else {
            proxy.metrics.rest.record_failure();
            return Error::RouteNotFound.into_response();
        };
        let name = captures
            .name("name")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let Some(version) = captures
            .name("version")
            .map(|m| m.as_str().to_string())
            .filter(|v| !v.is_empty())
        else {
            proxy.metrics.rest.record_failure();
            return Error::MissingVersion.into_response();
        };
        debug!(model = %name, version = %version, "Parsed model request");

        let target = match proxy.director.direct(&name, &version).await {
            Ok(target) => target,
            Err(e) => {
                proxy.metrics.rest.record_failure();
                error!(error = %e, path = %path, "Error handling request, aborting");
                return e.into_response();
            }
        };

        info!(target = %target, path = %path, "Forwarding request");
        match forward(&proxy.client, &target, request).await {
            Ok(response) => response,
            Err(e) => {
                proxy.metrics.rest.record_failure();
                error!(error = %e, target = %target, "Error forwarding request");
                e.into_response()
            }
        }
    }
}

/// Stream a request to `target_base` preserving method, path, query, headers
/// and body; the response streams back untouched.
async fn forward(
    client: &reqwest::Client,
    target_base: &str,
    request: Request<Body>,
) -> Result<Response, Error> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", target_base, path_and_query);

    let mut headers = parts.headers;
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONNECTION);
    // Keep the User-Agent header present (possibly empty) so the HTTP stack
    // does not inject a default one downstream.
    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(""));
    }

    let outbound = client
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .build()
        .map_err(|e| Error::transport(e.to_string()))?;

    let response = client
        .execute(outbound)
        .await
        .map_err(|e| Error::transport(e.to_string()))?;

    let mut builder = Response::builder().status(response.status());
    for (key, value) in response.headers() {
        if key == header::CONNECTION || key == header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(key, value);
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|e| Error::transport(e.to_string()))
}

// ────────────────────────────────
// src/proxy/proxy.rs
// Dispatcher: picks a backend, brackets the request with a connection
// count and relays it.
// ────────────────────────────────

use super::backend::ConnectionGuard;
use super::pool::ServerPool;
use crate::load_balancer::{LoadBalancer, SelectionError};
use crate::metrics::{MetricsCollector, Timer};
use hyper::body::{Bytes, HttpBody};
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Body, Client, Request, Response, StatusCode, Uri, Version};
use hyper_tls::HttpsConnector;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, error, Instrument};
use url::Url;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REQUEST_ID: &str = "x-request-id";

// Headers that describe a single hop and must not be relayed.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Peer address of the inbound connection, attached to each request by the
/// server loop.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

pub struct Proxy {
    pool: ServerPool,
    balancer: Arc<dyn LoadBalancer>,
    client: Client<HttpsConnector<HttpConnector>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Proxy {
    pub fn new(
        pool: ServerPool,
        balancer: Arc<dyn LoadBalancer>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let client = Client::builder().build::<_, Body>(HttpsConnector::new());

        Self {
            pool,
            balancer,
            client,
            metrics,
        }
    }

    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let span = tracing::info_span!(
            "request",
            id = %request_id,
            method = %req.method(),
            path = %req.uri().path(),
        );

        self.dispatch(req, request_id).instrument(span).await
    }

    async fn dispatch(
        &self,
        req: Request<Body>,
        request_id: String,
    ) -> Result<Response<Body>, ProxyError> {
        // Nothing is counted when selection fails.
        let backend = self.balancer.select_backend(&self.pool)?;
        let in_flight = InFlight::new(backend.acquire_connection(), self.metrics.clone());
        debug!(
            "Dispatching to {} ({} in flight)",
            backend.id,
            backend.active_connections()
        );

        let method = req.method().clone();
        let outbound = build_outbound_request(req, &backend.url, &request_id)?;
        let timer = Timer::new();

        match self.client.request(outbound).await {
            Ok(response) => {
                let status = response.status();
                backend.record_request(!status.is_server_error());
                if let Some(metrics) = &self.metrics {
                    metrics.record_request(method.as_str(), status.as_u16(), &backend.id, timer.elapsed());
                }

                let (mut parts, body) = response.into_parts();
                remove_hop_by_hop_headers(&mut parts.headers);

                // The connection stays counted until the body is fully relayed
                // or the client goes away.
                let body = Body::wrap_stream(TrackedBody {
                    inner: body,
                    _in_flight: in_flight,
                });
                Ok(Response::from_parts(parts, body))
            }
            Err(e) => {
                backend.record_request(false);
                error!("Forwarding to {} failed: {}", backend.id, e);
                Err(ProxyError::Backend(e))
            }
        }
    }
}

/// Rewrites an inbound URI to target `target`: scheme and authority come from
/// the backend, the backend's base path is joined to the request path and
/// both query strings are kept.
pub fn rewrite_uri(target: &Url, uri: &Uri) -> Result<Uri, ProxyError> {
    let host = target
        .host_str()
        .ok_or_else(|| ProxyError::InvalidUri(target.to_string()))?;
    let authority = match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut path_and_query = join_paths(target.path(), uri.path());
    let target_query = target.query().unwrap_or("");
    let request_query = uri.query().unwrap_or("");
    if !target_query.is_empty() || !request_query.is_empty() {
        path_and_query.push('?');
        path_and_query.push_str(target_query);
        if !target_query.is_empty() && !request_query.is_empty() {
            path_and_query.push('&');
        }
        path_and_query.push_str(request_query);
    }

    Uri::builder()
        .scheme(target.scheme())
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::InvalidUri(e.to_string()))
}

/// Places `path` (optionally carrying a query) beneath the backend URL,
/// keeping the backend's base path.
pub fn join_backend_path(base: &Url, path: &str) -> Url {
    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };

    let mut url = base.clone();
    url.set_path(&join_paths(base.path(), path));
    if query.is_some() {
        url.set_query(query);
    }
    url
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn build_outbound_request(
    req: Request<Body>,
    target: &Url,
    request_id: &str,
) -> Result<Request<Body>, ProxyError> {
    let client_ip = req.extensions().get::<ClientAddr>().map(|addr| addr.0.ip());
    let (mut parts, body) = req.into_parts();

    parts.uri = rewrite_uri(target, &parts.uri)?;
    parts.version = Version::HTTP_11;
    remove_hop_by_hop_headers(&mut parts.headers);
    // Let the client derive Host from the backend authority.
    parts.headers.remove(HOST);

    if let Some(ip) = client_ip {
        let mut hops: Vec<String> = parts
            .headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_owned)
            .collect();
        hops.push(ip.to_string());
        let forwarded = hops.join(", ");
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        parts.headers.insert(X_REQUEST_ID, value);
    }

    Ok(Request::from_parts(parts, body))
}

fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Owns the connection count for one forwarded request.
struct InFlight {
    guard: Option<ConnectionGuard>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl InFlight {
    fn new(guard: ConnectionGuard, metrics: Option<Arc<MetricsCollector>>) -> Self {
        if let Some(metrics) = &metrics {
            let backend = guard.backend();
            metrics.update_backend_connections(&backend.id, backend.active_connections());
        }
        Self {
            guard: Some(guard),
            metrics,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            let backend = Arc::clone(guard.backend());
            drop(guard);
            if let Some(metrics) = &self.metrics {
                metrics.update_backend_connections(&backend.id, backend.active_connections());
            }
        }
    }
}

/// Response body that releases its backend connection once dropped.
struct TrackedBody {
    inner: Body,
    _in_flight: InFlight,
}

impl futures::Stream for TrackedBody {
    type Item = Result<Bytes, hyper::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_data(cx)
    }
}

// Custom error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy backends available")]
    NoHealthyBackends,

    #[error("Invalid backend URI: {0}")]
    InvalidUri(String),

    #[error("Backend error: {0}")]
    Backend(#[from] hyper::Error),
}

impl From<SelectionError> for ProxyError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::NoHealthyBackend => ProxyError::NoHealthyBackends,
        }
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoHealthyBackends => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::InvalidUri(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Backend(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let message = match err {
            ProxyError::NoHealthyBackends => "No healthy backends available",
            ProxyError::InvalidUri(_) => "Internal server error",
            ProxyError::Backend(_) => "Bad gateway",
        };

        let mut response = Response::new(Body::from(message));
        *response.status_mut() = err.status();
        response
    }
}

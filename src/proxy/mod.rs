pub mod cache;
pub mod engine;
pub mod forwarder;
pub mod registry;

use std::net::SocketAddr;

use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;

pub use cache::{CacheStatus, ResponseCache};
pub use engine::Gateway;
pub use forwarder::ProxyForwarder;
pub use registry::{ResolvedRoute, ServiceRegistry, ServiceRoute};

/// Inbound request after the body has been buffered
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

impl ProxyRequest {
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }

    /// Idempotent reads are the only candidates for caching
    pub fn is_cacheable_method(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// `Cache-Control: no-store` or `no-cache` on the inbound request skips the
    /// cache, as does a `Range` request: partial bodies are never shared
    pub fn wants_cache_bypass(&self) -> bool {
        self.headers.contains_key(header::RANGE)
            || cache_control_has(&self.headers, &["no-store", "no-cache"])
    }
}

/// Response payload relayed from an upstream or produced locally. Cheap to
/// clone: the body is reference counted.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self { status, headers, body }
    }

    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        Self::new(status, headers, Bytes::from(value.to_string()))
    }
}

pub(crate) fn cache_control_has(headers: &HeaderMap, directives: &[&str]) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| directives.contains(&directive.as_str()))
}

/// Connection-management headers that never cross the proxy, including any
/// header named in the `Connection` header itself
pub(crate) fn is_hop_by_hop_header(name: &HeaderName, headers: &HeaderMap) -> bool {
    let standard = matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    );

    standard
        || headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case(name.as_str()))
}

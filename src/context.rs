use std::fmt;
use std::net::SocketAddr;

use axum::http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "x-correlation-id";
pub const API_KEY_HEADER: &str = "x-api-key";

/// Longest inbound correlation id we are willing to echo
const MAX_CORRELATION_ID_LEN: usize = 128;

/// Partition key for rate limiting.
///
/// The gateway never verifies `x-api-key` itself, so the header is only
/// honoured when `trust_api_key` says an edge in front of us has checked it.
/// Once a bearer token verifies, its subject replaces whatever was derived
/// from the headers, so rotating an unverified header cannot buy a fresh
/// window on authenticated routes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    Subject(String),
    ApiKey(String),
    Address(String),
}

impl ClientIdentity {
    pub fn from_request(headers: &HeaderMap, remote: Option<SocketAddr>, trust_api_key: bool) -> Self {
        let api_key = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|key| trust_api_key && !key.is_empty());
        if let Some(key) = api_key {
            return ClientIdentity::ApiKey(key.to_string());
        }

        match remote {
            Some(addr) => ClientIdentity::Address(addr.ip().to_string()),
            None => ClientIdentity::Address("unknown".to_string()),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientIdentity::Subject(subject) => write!(f, "sub:{}", subject),
            ClientIdentity::ApiKey(key) => write!(f, "key:{}", key),
            ClientIdentity::Address(addr) => write!(f, "ip:{}", addr),
        }
    }
}

/// Verified attributes of the caller's credential. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
    pub subject: String,
    pub expiry: u64,
    pub scopes: Vec<String>,
}

impl AuthClaims {
    /// Claims attached to requests on exempt paths
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.subject.is_empty()
    }
}

/// Per-request state threaded through every pipeline stage
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    pub correlation_id: String,
    pub deadline: Instant,
    pub client: ClientIdentity,
}

impl CorrelationContext {
    pub fn new(correlation_id: String, deadline: Instant, client: ClientIdentity) -> Self {
        Self {
            correlation_id,
            deadline,
            client,
        }
    }

    /// Echo a usable inbound correlation id, or mint a fresh one
    pub fn correlation_id_from(headers: &HeaderMap) -> String {
        headers
            .get(CORRELATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= MAX_CORRELATION_ID_LEN)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    pub fn header_value(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.correlation_id).ok()
    }

    /// Key the caller by its verified subject. Authentication calls this
    /// before any later stage reads `client`.
    pub fn bind_subject(&mut self, claims: &AuthClaims) {
        if !claims.is_anonymous() {
            self.client = ClientIdentity::Subject(claims.subject.clone());
        }
    }
}

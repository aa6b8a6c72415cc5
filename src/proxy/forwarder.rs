use std::time::Instant;

use anyhow::Result;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::context::{CorrelationContext, CORRELATION_HEADER};
use crate::error::{GatewayError, Result as GatewayResult};
use super::{is_hop_by_hop_header, ProxyRequest, ProxyResponse, ResolvedRoute};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Relays requests to upstream services over a pooled HTTP client
#[derive(Clone)]
pub struct ProxyForwarder {
    http_client: reqwest::Client,
}

impl ProxyForwarder {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(20)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("api-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { http_client })
    }

    /// Forward `request` to the resolved upstream within the request deadline.
    /// Upstream status codes and bodies pass through untouched; only
    /// transport failures become gateway errors.
    pub async fn forward(
        &self,
        request: &ProxyRequest,
        resolved: &ResolvedRoute,
        context: &CorrelationContext,
    ) -> GatewayResult<ProxyResponse> {
        let upstream_start = Instant::now();
        let target_url = resolved.upstream_url(request.query.as_deref());
        let route = resolved.route.name.as_str();

        debug!("Forwarding request {} to {}", context.correlation_id, target_url);

        let mut builder = self
            .http_client
            .request(request.method.clone(), &target_url)
            .headers(Self::upstream_headers(request, context));
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let exchange = async move {
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        let outcome = tokio::time::timeout_at(context.deadline, exchange).await;
        histogram!("gateway_upstream_duration_seconds", "route" => route.to_string())
            .record(upstream_start.elapsed().as_secs_f64());

        let (status, headers, body) = match outcome {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => return Err(Self::classify(route, &context.correlation_id, e)),
            Err(_) => {
                counter!("gateway_upstream_errors_total", "kind" => "timeout").increment(1);
                warn!(
                    "Upstream {} timed out for {} after {:?}",
                    route,
                    context.correlation_id,
                    upstream_start.elapsed()
                );
                return Err(GatewayError::GatewayTimeout(format!(
                    "upstream {} did not respond before the deadline",
                    route
                )));
            }
        };

        debug!(
            "Upstream {} answered {} for {} in {:?}",
            route,
            status,
            context.correlation_id,
            upstream_start.elapsed()
        );

        Ok(ProxyResponse::new(status, Self::downstream_headers(&headers), body))
    }

    fn classify(route: &str, correlation_id: &str, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            counter!("gateway_upstream_errors_total", "kind" => "timeout").increment(1);
            warn!("Upstream {} timed out for {}: {}", route, correlation_id, e);
            GatewayError::GatewayTimeout(format!("upstream {} timed out", route))
        } else if e.is_connect() {
            counter!("gateway_upstream_errors_total", "kind" => "connect").increment(1);
            warn!("Upstream {} unreachable for {}: {}", route, correlation_id, e);
            GatewayError::BadGateway(format!("upstream {} unreachable", route))
        } else {
            counter!("gateway_upstream_errors_total", "kind" => "protocol").increment(1);
            warn!("Upstream request to {} failed for {}: {}", route, correlation_id, e);
            GatewayError::BadGateway(format!("upstream {} request failed", route))
        }
    }

    fn upstream_headers(request: &ProxyRequest, context: &CorrelationContext) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(request.headers.len() + 4);
        for (name, value) in request.headers.iter() {
            if is_hop_by_hop_header(name, &request.headers)
                || name == header::HOST
                || name == header::CONTENT_LENGTH
                || name.as_str() == CORRELATION_HEADER
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(addr) = request.remote_addr {
            let chain = match request.headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{}, {}", prior, addr.ip()),
                None => addr.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&chain) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        if let Some(host) = request.headers.get(header::HOST) {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }
        if !headers.contains_key(&X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }
        if let Some(value) = context.header_value() {
            headers.insert(CORRELATION_HEADER, value);
        }

        headers
    }

    // body is fully buffered so framing headers are recomputed on the way out
    fn downstream_headers(upstream: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(upstream.len());
        for (name, value) in upstream.iter() {
            if is_hop_by_hop_header(name, upstream) || name == header::CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers
    }
}

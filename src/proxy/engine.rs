use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
    Router,
};
use bytes::Bytes;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, info, info_span, Instrument};

use crate::clock::SharedClock;
use crate::config::{Config, ServerConfig};
use crate::context::{AuthClaims, ClientIdentity, CorrelationContext, API_KEY_HEADER, CORRELATION_HEADER};
use crate::error::{GatewayError, Result as GatewayResult};
use crate::guard::auth::bearer_token;
use crate::guard::{AuthGate, RateLimitDecision, RateLimiter};
use crate::observability;
use super::{CacheStatus, ProxyForwarder, ProxyRequest, ProxyResponse, ResolvedRoute, ResponseCache, ServiceRegistry};

/// Served by the gateway itself rather than an upstream
pub const HEALTH_PATH: &str = "/health";

const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Everything one request accumulates on its way through the stages
pub struct PipelineState {
    pub request: ProxyRequest,
    pub context: CorrelationContext,
    pub claims: AuthClaims,
    pub rate_limit: Option<RateLimitDecision>,
    /// `None` for paths the gateway answers locally
    pub route: Option<ResolvedRoute>,
}

/// One gate in the request pipeline. Returning an error short-circuits:
/// no later stage runs and the error becomes the response.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, gateway: &Gateway, state: &mut PipelineState) -> GatewayResult<()>;
}

struct Authenticate;
struct Admit;
struct Resolve;

#[async_trait]
impl Stage for Authenticate {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    async fn run(&self, gateway: &Gateway, state: &mut PipelineState) -> GatewayResult<()> {
        let token = bearer_token(&state.request.headers);
        state.claims = gateway.auth.authorize(&state.request.path, token).await?;
        state.context.bind_subject(&state.claims);
        Ok(())
    }
}

#[async_trait]
impl Stage for Admit {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn run(&self, gateway: &Gateway, state: &mut PipelineState) -> GatewayResult<()> {
        let client = &state.context.client;
        let Some(decision) = gateway.limiter.admit(client, &state.request.path).await else {
            return Ok(());
        };

        state.rate_limit = Some(decision);
        if decision.allowed {
            Ok(())
        } else {
            Err(GatewayError::RateLimited {
                client: client.to_string(),
                limit: decision.limit,
                reset_after_ms: decision.reset_after_ms,
            })
        }
    }
}

#[async_trait]
impl Stage for Resolve {
    fn name(&self) -> &'static str {
        "resolve"
    }

    async fn run(&self, gateway: &Gateway, state: &mut PipelineState) -> GatewayResult<()> {
        let request = &state.request;
        let local = request.path == HEALTH_PATH
            && (request.method == Method::GET || request.method == Method::HEAD);
        if !local {
            state.route = Some(gateway.registry.resolve(&request.path)?);
        }
        Ok(())
    }
}

const STAGES: &[&dyn Stage] = &[&Authenticate, &Admit, &Resolve];

/// The request pipeline and the process-wide state its stages share
pub struct Gateway {
    config: Arc<Config>,
    auth: AuthGate,
    limiter: Arc<RateLimiter>,
    registry: Arc<ServiceRegistry>,
    cache: Arc<ResponseCache>,
    forwarder: ProxyForwarder,
    clock: SharedClock,
    started_at_ms: u64,
}

impl Gateway {
    pub fn new(config: &Config, clock: SharedClock) -> Result<Self> {
        let auth = AuthGate::from_config(&config.auth).context("Failed to build auth gate")?;
        let forwarder = ProxyForwarder::new(&config.proxy)?;

        Ok(Self {
            config: Arc::new(config.clone()),
            auth,
            limiter: Arc::new(RateLimiter::new(&config.rate_limiting, clock.clone())),
            registry: Arc::new(ServiceRegistry::from_config(&config.proxy.routes)),
            cache: Arc::new(ResponseCache::new(&config.caching, clock.clone())),
            forwarder,
            started_at_ms: clock.now_millis(),
            clock,
        })
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Background sweeps bounding limiter and cache memory. Abort the
    /// handles on shutdown.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if self.config.rate_limiting.enabled {
            handles.push(self.limiter.spawn_sweeper());
        }
        if self.cache.is_enabled() {
            handles.push(self.cache.spawn_sweeper());
        }
        handles
    }

    pub fn router(self: Arc<Self>) -> Router {
        let server = &self.config.server;

        Router::new()
            .fallback(handle_request)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer(server))
                    .layer(SetResponseHeaderLayer::if_not_present(
                        header::X_CONTENT_TYPE_OPTIONS,
                        HeaderValue::from_static("nosniff"),
                    ))
                    .layer(SetResponseHeaderLayer::if_not_present(
                        header::X_FRAME_OPTIONS,
                        HeaderValue::from_static("DENY"),
                    ))
                    .layer(SetResponseHeaderLayer::if_not_present(
                        header::REFERRER_POLICY,
                        HeaderValue::from_static("no-referrer"),
                    ))
                    .layer(SetResponseHeaderLayer::if_not_present(
                        header::X_DNS_PREFETCH_CONTROL,
                        HeaderValue::from_static("off"),
                    ))
                    .layer(CompressionLayer::new())
                    .into_inner(),
            )
            .with_state(self)
    }

    /// Bind the configured address and serve until the task is aborted
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        info!("API gateway listening on {}", addr);

        axum::serve(listener, self.router().into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("Server error")?;

        Ok(())
    }

    /// Run one request through every stage and emit the final response
    pub async fn handle(&self, request: Request, remote_addr: Option<SocketAddr>) -> Response {
        let started = Instant::now();
        let (parts, body) = request.into_parts();
        let correlation_id = CorrelationContext::correlation_id_from(&parts.headers);
        let span = info_span!(
            "request",
            correlation_id = %correlation_id,
            method = %parts.method,
            path = %parts.uri.path(),
        );

        async move {
            let client = ClientIdentity::from_request(
                &parts.headers,
                remote_addr,
                self.config.rate_limiting.trust_api_key,
            );
            let deadline = tokio::time::Instant::now() + self.config.server.request_timeout;

            let mut state = PipelineState {
                request: ProxyRequest {
                    method: parts.method,
                    path: parts.uri.path().to_string(),
                    query: parts.uri.query().map(str::to_string),
                    headers: parts.headers,
                    body: Bytes::new(),
                    remote_addr,
                },
                context: CorrelationContext::new(correlation_id, deadline, client),
                claims: AuthClaims::anonymous(),
                rate_limit: None,
                route: None,
            };

            let outcome = self.run(&mut state, body).await;
            let cache_status = outcome.as_ref().ok().and_then(|(_, status)| *status);
            let response = self.emit(&state, outcome);

            let elapsed = started.elapsed();
            observability::record_request(
                state.request.method.as_str(),
                response.status().as_u16(),
                elapsed.as_secs_f64(),
            );
            observability::log_access(
                &state.request.method,
                &state.request.path,
                response.status(),
                elapsed,
                &state.context.client,
                cache_status,
            );

            response
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        state: &mut PipelineState,
        body: Body,
    ) -> GatewayResult<(ProxyResponse, Option<CacheStatus>)> {
        for stage in STAGES {
            if let Err(e) = stage.run(self, state).await {
                debug!("Stage {} short-circuited with {}", stage.name(), e.error_code());
                return Err(e);
            }
        }

        state.request.body = self.read_body(body).await?;
        self.dispatch(state).await
    }

    async fn read_body(&self, body: Body) -> GatewayResult<Bytes> {
        let limit = self.config.server.body_limit_bytes;
        axum::body::to_bytes(body, limit).await.map_err(|e| {
            GatewayError::Validation(format!("request body rejected (limit {} bytes): {}", limit, e))
        })
    }

    /// Cache lookup for cacheable reads, otherwise straight to the origin
    async fn dispatch(&self, state: &PipelineState) -> GatewayResult<(ProxyResponse, Option<CacheStatus>)> {
        let request = &state.request;
        let rule = if request.is_cacheable_method() {
            self.cache.rule_for(request.method.as_str(), &request.path)
        } else {
            None
        };

        match rule {
            Some(rule) => {
                let key = ResponseCache::key_for(rule, request, &state.claims.subject);
                let (response, status) = self
                    .cache
                    .get_or_compute(&key, rule.ttl_seconds, request.wants_cache_bypass(), || {
                        self.origin(state)
                    })
                    .await?;
                Ok((response, Some(status)))
            }
            None => self.origin(state).await.map(|response| (response, None)),
        }
    }

    async fn origin(&self, state: &PipelineState) -> GatewayResult<ProxyResponse> {
        match &state.route {
            Some(route) => self.forwarder.forward(&state.request, route, &state.context).await,
            None => Ok(self.health_payload()),
        }
    }

    fn health_payload(&self) -> ProxyResponse {
        let upstreams: Vec<_> = self
            .registry
            .routes()
            .iter()
            .map(|route| json!({ "name": route.name, "healthy": route.healthy }))
            .collect();

        ProxyResponse::json(
            StatusCode::OK,
            &json!({
                "status": "success",
                "data": {
                    "service": "api-gateway",
                    "uptime_secs": self.clock.now_millis().saturating_sub(self.started_at_ms) / 1000,
                    "timestamp": self.clock.unix_millis(),
                    "upstreams": upstreams,
                }
            }),
        )
    }

    fn emit(
        &self,
        state: &PipelineState,
        outcome: GatewayResult<(ProxyResponse, Option<CacheStatus>)>,
    ) -> Response {
        let mut response = match outcome {
            Ok((payload, cache_status)) => {
                let mut response = Response::new(Body::from(payload.body));
                *response.status_mut() = payload.status;
                *response.headers_mut() = payload.headers;
                if let Some(status) = cache_status {
                    response
                        .headers_mut()
                        .insert(X_CACHE, HeaderValue::from_static(status.as_header()));
                }
                response
            }
            Err(e) => {
                if e.is_internal() {
                    error!("Internal error: {}", e.detail());
                } else {
                    debug!("Request rejected with {}: {}", e.error_code(), e.detail());
                }
                e.to_response(self.config.server.expose_error_details)
            }
        };

        let headers = response.headers_mut();
        if let Some(value) = state.context.header_value() {
            headers.insert(CORRELATION_HEADER, value);
        }
        if let Some(decision) = &state.rate_limit {
            headers.insert(RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
            headers.insert(RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
            headers.insert(RATELIMIT_RESET, HeaderValue::from(decision.reset_after_secs()));
            if !decision.allowed {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(decision.reset_after_secs()));
            }
        }

        response
    }
}

#[cfg(test)]
impl Gateway {
    /// Swap the token verifier
    pub fn with_auth(mut self, auth: AuthGate) -> Self {
        self.auth = auth;
        self
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }
}

async fn handle_request(
    State(gateway): State<Arc<Gateway>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    gateway
        .handle(request, connect_info.map(|ConnectInfo(addr)| addr))
        .await
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::PATCH])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(API_KEY_HEADER),
            HeaderName::from_static(CORRELATION_HEADER),
        ])
        .expose_headers([
            HeaderName::from_static(CORRELATION_HEADER),
            RATELIMIT_LIMIT,
            RATELIMIT_REMAINING,
            RATELIMIT_RESET,
        ]);

    if server.allowed_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = server
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin.trim()).ok())
        .collect();
    layer.allow_origin(origins).allow_credentials(true)
}

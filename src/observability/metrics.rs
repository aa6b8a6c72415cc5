use std::sync::Arc;

use anyhow::Result;
use axum::{routing::get, Router};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MetricsConfig;

/// Installs the Prometheus recorder and serves it on a dedicated listener.
///
/// Recording goes through the `metrics` macros everywhere else in the crate,
/// so without an installed recorder (tests, metrics disabled) every record is
/// a no-op.
pub struct MetricsCollector {
    config: MetricsConfig,
    prometheus_handle: PrometheusHandle,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let prometheus_handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

        Self::register_metrics();

        Ok(Self {
            config: config.clone(),
            prometheus_handle,
        })
    }

    fn register_metrics() {
        describe_counter!("gateway_requests_total", "Requests handled, by method and status class");
        describe_histogram!("gateway_request_duration_seconds", "End-to-end request duration in seconds");
        describe_counter!("gateway_rate_limited_total", "Requests denied by the rate limiter");
        describe_counter!("gateway_auth_failures_total", "Requests rejected by the auth gate");
        describe_counter!("gateway_cache_hits_total", "Responses served from cache");
        describe_counter!("gateway_cache_misses_total", "Cache misses that triggered a computation");
        describe_counter!("gateway_cache_coalesced_total", "Requests that joined an in-flight computation");
        describe_counter!("gateway_upstream_errors_total", "Upstream failures by kind");
        describe_histogram!("gateway_upstream_duration_seconds", "Upstream exchange duration in seconds");
    }

    /// Current exposition in the Prometheus text format
    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }

    /// Serve the exposition endpoint until the task is aborted
    pub async fn start_server(self: Arc<Self>) -> Result<()> {
        let collector = Arc::clone(&self);
        let app = Router::new().route(
            &self.config.path,
            get(move || {
                let collector = Arc::clone(&collector);
                async move { collector.render() }
            }),
        );

        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind metrics server on {}: {}", addr, e))?;

        info!("Metrics server listening on {}{}", addr, self.config.path);

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("Metrics server error: {}", e))?;

        Ok(())
    }
}

pub fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}

/// Record one completed request
pub fn record_request(method: &str, status: u16, duration: f64) {
    counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "status" => status_class(status)
    )
    .increment(1);
    histogram!("gateway_request_duration_seconds", "method" => method.to_string()).record(duration);
}

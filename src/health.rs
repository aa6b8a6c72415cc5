use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use futures_util::future::join_all;
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::HealthCheckConfig;
use crate::proxy::{ServiceRegistry, ServiceRoute};

/// Health status of an upstream route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Outcome of probing one upstream
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub route: String,
    pub status: HealthStatus,
    pub response_time: Duration,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// Consecutive-result streaks for one upstream. The verdict only flips once
/// a streak reaches its threshold, so a single slow check does not flap it.
#[derive(Debug, Clone)]
struct RouteHealth {
    consecutive_failures: u32,
    consecutive_successes: u32,
    healthy: bool,
}

impl Default for RouteHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            healthy: true,
        }
    }
}

impl RouteHealth {
    fn update(&mut self, result: &HealthCheckResult, config: &HealthCheckConfig) -> bool {
        match result.status {
            HealthStatus::Healthy => {
                self.consecutive_successes += 1;
                self.consecutive_failures = 0;
                if !self.healthy && self.consecutive_successes >= config.healthy_threshold {
                    self.healthy = true;
                }
            }
            HealthStatus::Unhealthy => {
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
                if self.healthy && self.consecutive_failures >= config.unhealthy_threshold {
                    self.healthy = false;
                }
            }
        }
        self.healthy
    }
}

/// Out-of-band checker that marks registry routes healthy or unhealthy.
/// The flag is advisory: request routing never consults it.
pub struct HealthChecker {
    client: Client,
    config: HealthCheckConfig,
    registry: Arc<ServiceRegistry>,
    route_health: DashMap<String, RouteHealth>,
}

impl HealthChecker {
    pub fn new(config: &HealthCheckConfig, registry: Arc<ServiceRegistry>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("api-gateway-health/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client for health checks: {}", e))?;

        Ok(Self {
            client,
            config: config.clone(),
            registry,
            route_health: DashMap::new(),
        })
    }

    /// Check every route until the handle is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            "Starting health checks for {} upstreams every {:?}",
            self.registry.routes().len(),
            self.config.interval
        );

        tokio::spawn(async move {
            let mut interval = interval(self.config.interval.max(Duration::from_secs(1)));
            loop {
                interval.tick().await;
                self.check_all().await;
            }
        })
    }

    /// One check round over the current route table. Checks run concurrently
    /// so a round takes at most one `timeout`. Returns the number of upstreams
    /// marked unhealthy afterwards.
    pub async fn check_all(&self) -> usize {
        let routes = self.registry.routes();
        let results = join_all(routes.iter().map(|route| self.check_route(route))).await;

        let mut unhealthy = 0;
        for result in results {
            match result.status {
                HealthStatus::Healthy => {
                    debug!(
                        "Health check passed for {}: HTTP {:?} in {}ms",
                        result.route,
                        result.status_code,
                        result.response_time.as_millis()
                    );
                }
                HealthStatus::Unhealthy => {
                    warn!(
                        "Health check failed for {}: {}",
                        result.route,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }

            let healthy = self
                .route_health
                .entry(result.route.clone())
                .or_default()
                .update(&result, &self.config);
            if !healthy {
                unhealthy += 1;
            }
            self.registry.set_health(&result.route, healthy);
        }

        unhealthy
    }

    pub async fn check_route(&self, route: &ServiceRoute) -> HealthCheckResult {
        let start_time = Instant::now();
        let health_url = format!("{}{}", route.target, route.health_path);

        let (status, status_code, error) =
            match tokio::time::timeout(self.config.timeout, self.client.get(&health_url).send()).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    (HealthStatus::Healthy, Some(response.status().as_u16()), None)
                }
                Ok(Ok(response)) => {
                    let code = response.status().as_u16();
                    (HealthStatus::Unhealthy, Some(code), Some(format!("HTTP {}", code)))
                }
                Ok(Err(e)) => (HealthStatus::Unhealthy, None, Some(e.to_string())),
                Err(_) => (
                    HealthStatus::Unhealthy,
                    None,
                    Some("Health check timeout".to_string()),
                ),
            };

        HealthCheckResult {
            route: route.name.clone(),
            status,
            response_time: start_time.elapsed(),
            status_code,
            error,
        }
    }
}

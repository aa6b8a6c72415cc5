use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::RateLimitingConfig;
use crate::context::ClientIdentity;
use super::{matches_any_prefix, path_matches_prefix};

/// Outcome of counting one request against its window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_after_ms: u64,
}

impl RateLimitDecision {
    /// Seconds until the window resets, rounded up so callers never retry early
    pub fn reset_after_secs(&self) -> u64 {
        self.reset_after_ms.div_ceil(1000)
    }
}

/// Fixed counting window for one key
#[derive(Debug, Clone)]
struct RateLimitWindow {
    window_start: u64,
    count: u64,
    last_seen: u64,
    window_size_ms: u64,
}

impl RateLimitWindow {
    fn new(now: u64, window_size_ms: u64) -> Self {
        Self {
            window_start: now,
            count: 0,
            last_seen: now,
            window_size_ms,
        }
    }

    /// Reset-if-elapsed plus increment. Callers hold exclusive access to the
    /// window for the whole call.
    fn hit(&mut self, now: u64, limit: u64, window_size_ms: u64) -> RateLimitDecision {
        self.window_size_ms = window_size_ms;
        self.last_seen = now;

        let mut elapsed = now.saturating_sub(self.window_start);
        if elapsed >= window_size_ms {
            self.window_start = now;
            self.count = 0;
            elapsed = 0;
        }

        // count never exceeds limit; a denial does not consume the window
        let allowed = self.count < limit;
        if allowed {
            self.count += 1;
        }

        RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(self.count),
            reset_after_ms: window_size_ms - elapsed,
        }
    }

    fn is_idle(&self, now: u64, idle_ttl_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) >= idle_ttl_ms
            && now.saturating_sub(self.window_start) >= self.window_size_ms
    }
}

/// Storage seam for window counters. The in-memory store keeps state local to
/// this process; a shared external store can implement the same contract.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one request for `key`, atomically resetting an elapsed window first
    async fn hit(&self, key: &str, limit: u64, window_size_ms: u64, now_ms: u64) -> RateLimitDecision;

    /// Drop windows that are both expired and idle for `idle_ttl_ms`
    async fn evict_idle(&self, now_ms: u64, idle_ttl_ms: u64) -> usize;

    fn active_windows(&self) -> usize;
}

/// Sharded map of windows; each hit holds only its own key's shard lock
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    windows: DashMap<String, RateLimitWindow>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn hit(&self, key: &str, limit: u64, window_size_ms: u64, now_ms: u64) -> RateLimitDecision {
        if let Some(mut window) = self.windows.get_mut(key) {
            return window.hit(now_ms, limit, window_size_ms);
        }

        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| RateLimitWindow::new(now_ms, window_size_ms));
        window.hit(now_ms, limit, window_size_ms)
    }

    async fn evict_idle(&self, now_ms: u64, idle_ttl_ms: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_idle(now_ms, idle_ttl_ms));
        before.saturating_sub(self.windows.len())
    }

    fn active_windows(&self) -> usize {
        self.windows.len()
    }
}

/// Per-client fixed-window rate limiter with per-route overrides
pub struct RateLimiter {
    config: RateLimitingConfig,
    store: Arc<dyn RateLimitStore>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(config: &RateLimitingConfig, clock: SharedClock) -> Self {
        Self::with_store(config, Arc::new(InMemoryRateLimitStore::new()), clock)
    }

    pub fn with_store(config: &RateLimitingConfig, store: Arc<dyn RateLimitStore>, clock: SharedClock) -> Self {
        Self {
            config: config.clone(),
            store,
            clock,
        }
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        !self.config.enabled || matches_any_prefix(path, &self.config.exempt_paths)
    }

    /// Count a request from `client` to `path`.
    ///
    /// Returns `None` for exempt paths: they are never counted and carry no
    /// rate-limit headers.
    pub async fn admit(&self, client: &ClientIdentity, path: &str) -> Option<RateLimitDecision> {
        if self.is_exempt(path) {
            return None;
        }

        let (scope, window, limit) = self.limits_for(path);
        let key = format!("{}|{}", scope, client);
        let window_ms = (window.as_millis() as u64).max(1);

        let decision = self.store.hit(&key, limit, window_ms, self.clock.now_millis()).await;

        if decision.allowed {
            debug!(
                "Rate limit check passed for {} ({} remaining)",
                client, decision.remaining
            );
        } else {
            counter!("gateway_rate_limited_total").increment(1);
            warn!(
                "Rate limit exceeded for {} on {}, resets in {}ms",
                client, scope, decision.reset_after_ms
            );
        }

        Some(decision)
    }

    /// Longest configured override wins; otherwise the global window applies
    fn limits_for(&self, path: &str) -> (&str, Duration, u64) {
        self.config
            .routes
            .iter()
            .filter(|route| path_matches_prefix(path, &route.prefix))
            .max_by_key(|route| route.prefix.trim_end_matches('/').len())
            .map(|route| (route.prefix.as_str(), route.window, route.max_requests))
            .unwrap_or(("*", self.config.window, self.config.max_requests))
    }

    pub async fn evict_idle(&self) -> usize {
        let idle_ttl_ms = self.config.idle_ttl.as_millis() as u64;
        let evicted = self.store.evict_idle(self.clock.now_millis(), idle_ttl_ms).await;
        if evicted > 0 {
            debug!(
                "Evicted {} idle rate-limit windows, {} active",
                evicted,
                self.store.active_windows()
            );
        }
        evicted
    }

    pub fn active_windows(&self) -> usize {
        self.store.active_windows()
    }

    /// Periodically evict idle windows to bound memory
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = self.config.sweep_interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                limiter.evict_idle().await;
            }
        })
    }
}

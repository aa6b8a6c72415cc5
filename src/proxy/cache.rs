use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::{CacheRule, CachingConfig};
use crate::error::{GatewayError, Result as GatewayResult};
use crate::guard::path_matches_prefix;
use super::{cache_control_has, ProxyRequest, ProxyResponse};

/// How a response was obtained, reported in the `X-Cache` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    /// Shared the result of a computation another request started
    Coalesced,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_header(&self) -> &'static str {
        match self {
            CacheStatus::Hit | CacheStatus::Coalesced => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: ProxyResponse,
    stored_at_ms: u64,
    ttl_ms: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.stored_at_ms) >= self.ttl_ms
    }
}

type FlightResult = GatewayResult<ProxyResponse>;

/// Marker for a computation in progress. Waiters subscribe to the channel;
/// dropping the sender without a value tells them it was abandoned.
struct InFlight {
    tx: watch::Sender<Option<FlightResult>>,
}

impl InFlight {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }
}

/// Removes the in-flight marker even if the leading request is cancelled
struct FlightGuard<'a> {
    in_flight: &'a DashMap<String, Arc<InFlight>>,
    key: &'a str,
    flight: &'a Arc<InFlight>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(self.key, |_, current| Arc::ptr_eq(current, self.flight));
    }
}

enum Role {
    Leader(Arc<InFlight>),
    Waiter(watch::Receiver<Option<FlightResult>>),
}

/// TTL response cache with per-key request coalescing
pub struct ResponseCache {
    config: CachingConfig,
    entries: DashMap<String, CacheEntry>,
    in_flight: DashMap<String, Arc<InFlight>>,
    clock: SharedClock,
}

impl ResponseCache {
    pub fn new(config: &CachingConfig, clock: SharedClock) -> Self {
        Self {
            config: config.clone(),
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Most specific rule covering this method and path
    pub fn rule_for(&self, method: &str, path: &str) -> Option<&CacheRule> {
        if !self.config.enabled {
            return None;
        }

        self.config
            .rules
            .iter()
            .filter(|rule| path_matches_prefix(path, &rule.prefix))
            .filter(|rule| rule.methods.iter().any(|m| m.eq_ignore_ascii_case(method)))
            .max_by_key(|rule| rule.prefix.trim_end_matches('/').len())
    }

    /// Keys are partitioned by credential subject so one caller's response
    /// is never served to another
    pub fn key_for(rule: &CacheRule, request: &ProxyRequest, subject: &str) -> String {
        format!(
            "{}{}:{}:{}",
            rule.key_prefix,
            request.method,
            subject,
            request.path_and_query()
        )
    }

    /// Unexpired payload for `key`, purging it lazily when stale
    pub fn get(&self, key: &str) -> Option<ProxyResponse> {
        let now = self.clock.now_millis();

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.payload.clone());
            }
        }

        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Serve `key` from cache, or run `compute` exactly once across all
    /// concurrent callers and share its outcome. Only 200 responses with a
    /// positive TTL are stored; failures reach every waiter and are
    /// never cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl_seconds: u64,
        bypass: bool,
        compute: F,
    ) -> GatewayResult<(ProxyResponse, CacheStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult>,
    {
        if bypass || ttl_seconds == 0 || !self.config.enabled {
            return compute().await.map(|response| (response, CacheStatus::Bypass));
        }

        if let Some(hit) = self.get(key) {
            counter!("gateway_cache_hits_total").increment(1);
            debug!("Cache HIT for key: {}", key);
            return Ok((hit, CacheStatus::Hit));
        }

        let role = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(occupied) => Role::Waiter(occupied.get().tx.subscribe()),
            Entry::Vacant(vacant) => {
                // a leader may have stored and left between our lookup and here
                if let Some(hit) = self.get(key) {
                    drop(vacant);
                    counter!("gateway_cache_hits_total").increment(1);
                    return Ok((hit, CacheStatus::Hit));
                }
                let flight = Arc::new(InFlight::new());
                vacant.insert(Arc::clone(&flight));
                Role::Leader(flight)
            }
        };

        match role {
            Role::Waiter(rx) => {
                counter!("gateway_cache_coalesced_total").increment(1);
                debug!("Coalescing request for key: {}", key);
                Self::wait_for_leader(rx)
                    .await
                    .map(|response| (response, CacheStatus::Coalesced))
            }
            Role::Leader(flight) => {
                counter!("gateway_cache_misses_total").increment(1);
                debug!("Cache MISS for key: {}", key);

                let guard = FlightGuard {
                    in_flight: &self.in_flight,
                    key,
                    flight: &flight,
                };

                let result = compute().await;
                if let Ok(response) = &result {
                    if Self::is_storable(response) {
                        self.store(key, response.clone(), ttl_seconds);
                    }
                }

                // marker goes first so late arrivals see the stored entry
                drop(guard);
                flight.tx.send_replace(Some(result.clone()));

                result.map(|response| (response, CacheStatus::Miss))
            }
        }
    }

    async fn wait_for_leader(mut rx: watch::Receiver<Option<FlightResult>>) -> FlightResult {
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => match outcome.as_ref() {
                Some(result) => result.clone(),
                None => Err(GatewayError::Internal("coalesced result missing".to_string())),
            },
            Err(_) => Err(GatewayError::BadGateway(
                "upstream request was abandoned".to_string(),
            )),
        }
    }

    /// Only complete representations are stored; a 206 or 204 would be
    /// replayed to callers that asked for the whole resource
    fn is_storable(response: &ProxyResponse) -> bool {
        response.status == StatusCode::OK && !cache_control_has(&response.headers, &["no-store", "private"])
    }

    fn store(&self, key: &str, payload: ProxyResponse, ttl_seconds: u64) {
        if self.config.max_entries == 0 {
            return;
        }
        if self.entries.len() >= self.config.max_entries && !self.entries.contains_key(key) {
            self.evict_oldest();
        }

        let entry = CacheEntry {
            payload,
            stored_at_ms: self.clock.now_millis(),
            ttl_ms: ttl_seconds.saturating_mul(1000),
        };
        debug!("Cache SET for key: {}, TTL: {}s", key, ttl_seconds);
        self.entries.insert(key.to_string(), entry);
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().stored_at_ms)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            debug!("Evicted oldest cache entry: {}", key);
        }
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!("Cleaned up {} expired cache entries", purged);
        }
        purged
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.config.sweep_interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                cache.purge_expired();
            }
        })
    }
}

#[cfg(test)]
impl ResponseCache {
    fn stored_at(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.stored_at_ms)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_with(clock: Arc<ManualClock>, max_entries: usize) -> Arc<ResponseCache> {
        let config = CachingConfig {
            max_entries,
            ..CachingConfig::default()
        };
        Arc::new(ResponseCache::new(&config, clock))
    }

    fn ok(body: &'static str) -> ProxyResponse {
        ProxyResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn test_hit_within_ttl_skips_computation() {
        let clock = ManualClock::new();
        let cache = cache_with(clock.clone(), 100);
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let (response, _) = cache
                .get_or_compute("health:GET::/health", 60, false, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ok("up"))
                })
                .await
                .unwrap();
            assert_eq!(response.body, Bytes::from_static(b"up"));
            clock.advance_secs(10);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_recomputed() {
        let clock = ManualClock::new();
        let cache = cache_with(clock.clone(), 100);
        let key = "health:GET::/health";

        let (_, status) = cache.get_or_compute(key, 60, false, || async { Ok(ok("first")) }).await.unwrap();
        assert_eq!(status, CacheStatus::Miss);
        let first_stored = cache.stored_at(key).unwrap();

        clock.advance_secs(61);
        let (response, status) = cache
            .get_or_compute(key, 60, false, || async { Ok(ok("second")) })
            .await
            .unwrap();

        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(response.body, Bytes::from_static(b"second"));
        assert!(cache.stored_at(key).unwrap() > first_stored);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_compute_once() {
        let cache = cache_with(ManualClock::new(), 100);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("health:GET::/health", 60, false, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(ok("shared"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let (response, _) = handle.await.unwrap().unwrap();
            assert_eq!(response.body, Bytes::from_static(b"shared"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_reaches_every_waiter_and_is_not_cached() {
        let cache = cache_with(ManualClock::new(), 100);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k", 60, false, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(GatewayError::BadGateway("connection refused".to_string()))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(GatewayError::BadGateway(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 0);

        let (_, status) = cache.get_or_compute("k", 60, false, || async { Ok(ok("back")) }).await.unwrap();
        assert_eq!(status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_only_complete_successes_are_stored() {
        let cache = cache_with(ManualClock::new(), 100);

        let failing = ProxyResponse::new(StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), Bytes::new());
        cache.get_or_compute("a", 60, false, || async move { Ok(failing) }).await.unwrap();
        assert!(cache.get("a").is_none());

        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, max-age=30"));
        let private = ProxyResponse::new(StatusCode::OK, headers, Bytes::new());
        cache.get_or_compute("b", 60, false, || async move { Ok(private) }).await.unwrap();
        assert!(cache.get("b").is_none());

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 0-4/10"));
        let partial = ProxyResponse::new(StatusCode::PARTIAL_CONTENT, headers, Bytes::from_static(b"01234"));
        let (_, status) = cache
            .get_or_compute("c", 60, false, || async move { Ok(partial) })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert!(cache.get("c").is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_and_bypass_always_compute() {
        let cache = cache_with(ManualClock::new(), 100);
        let calls = AtomicUsize::new(0);

        for bypass in [false, true] {
            let ttl = if bypass { 60 } else { 0 };
            for _ in 0..2 {
                let (_, status) = cache
                    .get_or_compute("k", ttl, bypass, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(ok("fresh"))
                    })
                    .await
                    .unwrap();
                assert_eq!(status, CacheStatus::Bypass);
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_leader_releases_waiters() {
        let cache = cache_with(ManualClock::new(), 100);

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("slow", 60, false, || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(ok("never"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.in_flight(), 1);

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("slow", 60, false, || async { Ok(ok("unused")) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        leader.abort();
        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Err(GatewayError::BadGateway(_))));
        assert_eq!(cache.in_flight(), 0);

        let (response, status) = cache
            .get_or_compute("slow", 60, false, || async { Ok(ok("retry")) })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(response.body, Bytes::from_static(b"retry"));
    }

    #[tokio::test]
    async fn test_oldest_entry_evicted_at_capacity() {
        let clock = ManualClock::new();
        let cache = cache_with(clock.clone(), 2);

        for key in ["one", "two", "three"] {
            cache.get_or_compute(key, 60, false, || async { Ok(ok("x")) }).await.unwrap();
            clock.advance_millis(5);
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get("one").is_none());
        assert!(cache.get("three").is_some());
    }

    #[tokio::test]
    async fn test_purge_and_rule_selection() {
        let clock = ManualClock::new();
        let cache = cache_with(clock.clone(), 100);
        cache.get_or_compute("k", 1, false, || async { Ok(ok("x")) }).await.unwrap();

        clock.advance_secs(2);
        assert_eq!(cache.purge_expired(), 1);

        let rule = cache.rule_for("GET", "/health").unwrap();
        assert_eq!(rule.key_prefix, "health:");
        assert!(cache.rule_for("POST", "/health").is_none());
        assert!(cache.rule_for("GET", "/api/v1/leads").is_none());

        let request = ProxyRequest {
            method: Method::GET,
            path: "/health".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        };
        assert_eq!(ResponseCache::key_for(rule, &request, "user-1"), "health:GET:user-1:/health");
    }
}

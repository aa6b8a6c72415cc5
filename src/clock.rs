#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

/// Source of "now" for every time-window and TTL computation in the gateway.
///
/// `now_millis` is monotonic and only meaningful relative to other readings
/// from the same clock. `unix_millis` is wall time and is only used for
/// payloads shown to callers.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed on a monotonic timeline
    fn now_millis(&self) -> u64;

    /// Wall-clock time as milliseconds since the Unix epoch
    fn unix_millis(&self) -> i64;
}

pub type SharedClock = Arc<dyn Clock>;

/// Real clock backed by `Instant` for the monotonic reading
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn unix_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Both readings advance together.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    elapsed_ms: AtomicU64,
    epoch_ms: i64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Arc<Self> {
        Self::starting_at(1_700_000_000_000)
    }

    /// Create a clock whose wall reading starts at `epoch_ms`
    pub fn starting_at(epoch_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            elapsed_ms: AtomicU64::new(0),
            epoch_ms,
        })
    }

    pub fn advance_millis(&self, ms: u64) {
        self.elapsed_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_millis(secs * 1000);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.elapsed_ms.load(Ordering::SeqCst)
    }

    fn unix_millis(&self) -> i64 {
        self.epoch_ms + self.now_millis() as i64
    }
}

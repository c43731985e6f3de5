//! Per-endpoint rate limiting.
//!
//! Two limiters guard validation: [`UsageLimiter`] caps how often a single
//! endpoint is picked up, and [`BadProxyLimiter`] backs off endpoints that
//! recently failed. Both are owned by one pool instance.

use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Throttles how frequently one endpoint may be used.
pub struct UsageLimiter {
    limiter: KeyedLimiter,
    clock: DefaultClock,
}

impl UsageLimiter {
    pub fn new(quota: Quota) -> Self {
        Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        }
    }

    /// Consume one use of `endpoint`.
    ///
    /// `Err` carries how long until the endpoint may be used again.
    pub fn check(&self, endpoint: &str) -> Result<(), Duration> {
        self.limiter
            .check_key(&endpoint.to_string())
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Drop state for endpoints whose quota has fully replenished.
    pub fn prune(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    /// Number of endpoints with tracked state.
    pub fn len(&self) -> usize {
        self.limiter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Strike {
    count: u32,
    until: Instant,
}

/// Exponential backoff for endpoints that failed validation.
///
/// Each strike doubles the window, starting from `base` and capped at `max`.
pub struct BadProxyLimiter {
    base: Duration,
    max: Duration,
    strikes: Mutex<HashMap<String, Strike>>,
}

impl BadProxyLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            strikes: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return the resulting backoff window.
    pub fn strike(&self, endpoint: &str) -> Duration {
        let now = Instant::now();
        let mut strikes = self.strikes.lock();
        let entry = strikes.entry(endpoint.to_string()).or_insert(Strike {
            count: 0,
            until: now,
        });
        entry.count = entry.count.saturating_add(1);
        let factor = 1u32 << (entry.count - 1).min(16);
        let window = self.base.saturating_mul(factor).min(self.max);
        entry.until = now + window;
        window
    }

    /// Whether `endpoint` is currently backed off. Does not record anything.
    pub fn peek(&self, endpoint: &str) -> bool {
        self.retry_after(endpoint).is_some()
    }

    /// Remaining backoff for `endpoint`, if any.
    pub fn retry_after(&self, endpoint: &str) -> Option<Duration> {
        let now = Instant::now();
        self.strikes
            .lock()
            .get(endpoint)
            .and_then(|s| s.until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// Number of strikes recorded against `endpoint`.
    pub fn strikes(&self, endpoint: &str) -> u32 {
        self.strikes.lock().get(endpoint).map(|s| s.count).unwrap_or(0)
    }

    /// Drop state for an evicted endpoint.
    pub fn forget(&self, endpoint: &str) {
        self.strikes.lock().remove(endpoint);
    }

    /// Copy of the internal state, sorted by endpoint.
    pub fn snapshot(&self) -> Vec<(String, u32, Instant)> {
        let mut out: Vec<_> = self
            .strikes
            .lock()
            .iter()
            .map(|(k, s)| (k.clone(), s.count, s.until))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

//! Pool counters.

use crate::proxy::Protocol;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live counters shared by validation workers, the dispenser and the autoscaler.
#[derive(Debug)]
pub struct Stats {
    valid4: AtomicU64,
    valid4a: AtomicU64,
    valid5: AtomicU64,
    stale: AtomicU64,
    dispensed: AtomicU64,
    checked: AtomicU64,
    bad: AtomicU64,
    evicted: AtomicU64,
    birthday: Instant,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Successful SOCKS4 validations.
    pub valid4: u64,
    /// Successful SOCKS4a validations.
    pub valid4a: u64,
    /// Successful SOCKS5 validations.
    pub valid5: u64,
    /// Proxies skipped at dispense time for being stale.
    pub stale: u64,
    /// Proxies handed out.
    pub dispensed: u64,
    /// Validation rounds started.
    pub checked: u64,
    /// Validation rounds that failed on every protocol.
    pub bad: u64,
    /// Endpoints removed from the registry.
    pub evicted: u64,
}

impl StatsSnapshot {
    pub fn total_validated(&self) -> u64 {
        self.valid4 + self.valid4a + self.valid5
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            valid4: AtomicU64::new(0),
            valid4a: AtomicU64::new(0),
            valid5: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            dispensed: AtomicU64::new(0),
            checked: AtomicU64::new(0),
            bad: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            birthday: Instant::now(),
        }
    }

    pub(crate) fn record_valid(&self, protocol: Protocol) {
        let counter = match protocol {
            Protocol::Socks4 => &self.valid4,
            Protocol::Socks4a => &self.valid4a,
            Protocol::Socks5 => &self.valid5,
            Protocol::Unknown => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispensed(&self) {
        self.dispensed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checked(&self) {
        self.checked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bad(&self) {
        self.bad.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_validated(&self) -> u64 {
        self.valid4.load(Ordering::Relaxed)
            + self.valid4a.load(Ordering::Relaxed)
            + self.valid5.load(Ordering::Relaxed)
    }

    pub fn dispensed(&self) -> u64 {
        self.dispensed.load(Ordering::Relaxed)
    }

    /// Validated proxies not yet dispensed. Saturates at zero, since a
    /// recycled proxy can be dispensed more than once.
    pub fn backlog(&self) -> u64 {
        self.total_validated().saturating_sub(self.dispensed())
    }

    pub fn uptime(&self) -> Duration {
        self.birthday.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            valid4: self.valid4.load(Ordering::Relaxed),
            valid4a: self.valid4a.load(Ordering::Relaxed),
            valid5: self.valid5.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            dispensed: self.dispensed.load(Ordering::Relaxed),
            checked: self.checked.load(Ordering::Relaxed),
            bad: self.bad.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

//! Proxy representation, protocol negotiation results and per-entry soft locking.

use parking_lot::Mutex;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// SOCKS protocol version confirmed for a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Not validated yet.
    Unknown,
    Socks4,
    Socks4a,
    Socks5,
}

impl Protocol {
    /// Negotiation order used during validation.
    pub const NEGOTIATION_ORDER: [Protocol; 3] =
        [Protocol::Socks5, Protocol::Socks4, Protocol::Socks4a];

    /// URL scheme understood by reqwest for this protocol.
    pub fn scheme(self) -> Option<&'static str> {
        match self {
            Protocol::Unknown => None,
            Protocol::Socks4 => Some("socks4"),
            Protocol::Socks4a => Some("socks4a"),
            // remote DNS, like the front-end clients expect
            Protocol::Socks5 => Some("socks5h"),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Protocol::Unknown => 0,
            Protocol::Socks4 => 4,
            Protocol::Socks4a => 40,
            Protocol::Socks5 => 5,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            4 => Protocol::Socks4,
            40 => Protocol::Socks4a,
            5 => Protocol::Socks5,
            _ => Protocol::Unknown,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Unknown => "unknown",
            Protocol::Socks4 => "socks4",
            Protocol::Socks4a => "socks4a",
            Protocol::Socks5 => "socks5",
        };
        f.write_str(name)
    }
}

/// Independent copy of a validated proxy, handed to callers.
///
/// Mutating a `Proxy` never touches the pool's own record of the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Proxy {
    /// The `host:port` of the proxy.
    pub endpoint: String,
    /// Confirmed protocol.
    pub protocol: Protocol,
    /// WAN address observed through the proxy on its last validation.
    pub external_ip: Option<IpAddr>,
    /// Time of the last successful validation.
    pub last_validated: Option<Instant>,
    /// Number of successful validation rounds.
    pub times_validated: u64,
    /// Number of times the proxy was marked bad.
    pub times_bad: u64,
}

impl Proxy {
    /// Proxy URL, e.g. `socks5h://127.0.0.1:1080`.
    pub fn url(&self) -> String {
        match self.protocol.scheme() {
            Some(scheme) => format!("{}://{}", scheme, self.endpoint),
            None => self.endpoint.clone(),
        }
    }

    /// Convert the proxy URL to a reqwest::Proxy.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        reqwest::Proxy::all(self.url())
    }

    /// Whether the last validation is older than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match self.last_validated {
            Some(at) => at.elapsed() > max_age,
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct Observation {
    external_ip: Option<IpAddr>,
    last_validated: Option<Instant>,
}

/// The pool's authoritative record of one endpoint.
#[derive(Debug)]
pub struct ProxyEntry {
    endpoint: String,
    protocol: AtomicU8,
    times_validated: AtomicU64,
    times_bad: AtomicU64,
    observation: Mutex<Observation>,
    soft_lock: AtomicBool,
}

impl ProxyEntry {
    pub(crate) fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            protocol: AtomicU8::new(Protocol::Unknown.to_u8()),
            times_validated: AtomicU64::new(0),
            times_bad: AtomicU64::new(0),
            observation: Mutex::new(Observation::default()),
            soft_lock: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.protocol.load(Ordering::Acquire))
    }

    /// Record the negotiated protocol. Only the first concrete value sticks;
    /// returns whether this call set it.
    pub fn set_protocol(&self, protocol: Protocol) -> bool {
        if protocol == Protocol::Unknown {
            return false;
        }
        self.protocol
            .compare_exchange(
                Protocol::Unknown.to_u8(),
                protocol.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn times_bad(&self) -> u64 {
        self.times_bad.load(Ordering::Acquire)
    }

    pub fn times_validated(&self) -> u64 {
        self.times_validated.load(Ordering::Acquire)
    }

    /// Increment the bad counter and return the new value.
    pub(crate) fn mark_bad(&self) -> u64 {
        self.times_bad.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn last_validated(&self) -> Option<Instant> {
        self.observation.lock().last_validated
    }

    /// Stamp a successful validation and return a copy of the result.
    pub(crate) fn record_validation(&self, protocol: Protocol, external_ip: IpAddr) -> Proxy {
        let mut obs = self.observation.lock();
        obs.last_validated = Some(Instant::now());
        obs.external_ip = Some(external_ip);
        self.set_protocol(protocol);
        let times_validated = self.times_validated.fetch_add(1, Ordering::AcqRel) + 1;
        Proxy {
            endpoint: self.endpoint.clone(),
            protocol: self.protocol(),
            external_ip: obs.external_ip,
            last_validated: obs.last_validated,
            times_validated,
            times_bad: self.times_bad(),
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, age: Duration) {
        let mut obs = self.observation.lock();
        obs.last_validated = Instant::now().checked_sub(age);
    }

    /// Try to take the soft lock without waiting.
    ///
    /// `None` means another task is examining this entry; skip it.
    pub fn try_lock(&self) -> Option<SoftLockGuard<'_>> {
        self.soft_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SoftLockGuard { entry: self })
    }

    pub fn is_locked(&self) -> bool {
        self.soft_lock.load(Ordering::Acquire)
    }
}

/// Holds an entry's soft lock; released on drop.
pub struct SoftLockGuard<'a> {
    entry: &'a ProxyEntry,
}

impl SoftLockGuard<'_> {
    pub fn entry(&self) -> &ProxyEntry {
        self.entry
    }

    /// Copy the entry while the lock is held.
    pub fn snapshot(&self) -> Proxy {
        let obs = self.entry.observation.lock();
        Proxy {
            endpoint: self.entry.endpoint.clone(),
            protocol: self.entry.protocol(),
            external_ip: obs.external_ip,
            last_validated: obs.last_validated,
            times_validated: self.entry.times_validated(),
            times_bad: self.entry.times_bad(),
        }
    }
}

impl Drop for SoftLockGuard<'_> {
    fn drop(&mut self) {
        self.entry.soft_lock.store(false, Ordering::Release);
    }
}

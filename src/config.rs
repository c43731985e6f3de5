//! Configuration for the proxy pool.

use crate::error::{PoolError, Result};

use governor::Quota;
use std::num::NonZeroU32;
use std::time::Duration;

/// Plain-text IP echo services used to confirm a proxy reaches the internet.
pub const DEFAULT_ECHO_ENDPOINTS: &[&str] = &[
    "https://wtfismyip.com/text",
    "https://myexternalip.com/raw",
    "https://ipinfo.io/ip",
    "https://api.ipify.org/",
    "https://icanhazip.com/",
    "https://ifconfig.me/ip",
    "https://www.trackip.net/ip",
    "https://checkip.amazonaws.com/",
];

/// Outbound identity strings picked at random for validation requests.
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "curl/8.7.1",
];

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// A validated proxy older than this is not dispensed.
    pub stale_after: Duration,
    /// Timeout applied to each protocol attempt and to dispense-time re-dials.
    pub validation_timeout: Duration,
    /// Initial size of the validation worker pool.
    pub workers: usize,
    /// Upper bound for the validation worker pool.
    pub max_workers: usize,
    /// Re-queue dispensed proxies for another validation round.
    pub recycle: bool,
    /// Evict an endpoint once it has been marked bad this many times.
    pub remove_after: u64,
    /// Plain-text IP echo URLs.
    pub echo_endpoints: Vec<String>,
    /// User agents sent with validation requests.
    pub user_agents: Vec<String>,
    /// Capacity of the pending queue and of each output queue.
    pub buffer_size: usize,
    /// How often one endpoint may be picked up for validation.
    pub usage_quota: Quota,
    /// First backoff window after a failed validation round.
    pub bad_backoff: Duration,
    /// Ceiling for the exponential bad-proxy backoff.
    pub max_bad_backoff: Duration,
    /// Backlog level the autoscaler steers around.
    pub scale_threshold: u64,
    /// Start with the autoscaler enabled.
    pub autoscale: bool,
    /// Tick period of the autoscaler.
    pub scale_interval: Duration,
    /// Number of extra proxies the request middleware tries after a failure.
    pub dispatch_retries: usize,
    /// How long the request middleware waits for a proxy to be dispensed.
    pub dispense_timeout: Duration,
}

impl PoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(PoolError::InvalidConfig("max_workers must be at least 1".into()));
        }
        if self.workers == 0 || self.workers > self.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "workers must be within 1..={}",
                self.max_workers
            )));
        }
        if self.remove_after == 0 {
            return Err(PoolError::InvalidConfig("remove_after must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(PoolError::InvalidConfig("buffer_size must be at least 1".into()));
        }
        if self.echo_endpoints.is_empty() {
            return Err(PoolError::InvalidConfig("at least one echo endpoint is required".into()));
        }
        if self.validation_timeout.is_zero() {
            return Err(PoolError::InvalidConfig("validation_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfigBuilder::new().build()
    }
}

/// Builder for `PoolConfig`.
pub struct PoolConfigBuilder {
    stale_after: Option<Duration>,
    validation_timeout: Option<Duration>,
    workers: Option<usize>,
    max_workers: Option<usize>,
    recycle: Option<bool>,
    remove_after: Option<u64>,
    echo_endpoints: Option<Vec<String>>,
    user_agents: Option<Vec<String>>,
    buffer_size: Option<usize>,
    usage_quota: Option<Quota>,
    bad_backoff: Option<Duration>,
    max_bad_backoff: Option<Duration>,
    scale_threshold: Option<u64>,
    autoscale: Option<bool>,
    scale_interval: Option<Duration>,
    dispatch_retries: Option<usize>,
    dispense_timeout: Option<Duration>,
}

impl PoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            stale_after: None,
            validation_timeout: None,
            workers: None,
            max_workers: None,
            recycle: None,
            remove_after: None,
            echo_endpoints: None,
            user_agents: None,
            buffer_size: None,
            usage_quota: None,
            bad_backoff: None,
            max_bad_backoff: None,
            scale_threshold: None,
            autoscale: None,
            scale_interval: None,
            dispatch_retries: None,
            dispense_timeout: None,
        }
    }

    /// Set the age after which a validated proxy is considered stale.
    pub fn stale_after(mut self, age: Duration) -> Self {
        self.stale_after = Some(age);
        self
    }

    /// Set the per-attempt validation timeout.
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = Some(timeout);
        self
    }

    /// Set the initial number of validation workers.
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = Some(count);
        self
    }

    /// Set the maximum number of validation workers.
    pub fn max_workers(mut self, count: usize) -> Self {
        self.max_workers = Some(count);
        self
    }

    /// Enable or disable recycling of dispensed proxies.
    pub fn recycle(mut self, enabled: bool) -> Self {
        self.recycle = Some(enabled);
        self
    }

    /// Set how many bad marks evict an endpoint.
    pub fn remove_after(mut self, count: u64) -> Self {
        self.remove_after = Some(count);
        self
    }

    /// Set the IP echo URLs.
    pub fn echo_endpoints(mut self, urls: Vec<impl Into<String>>) -> Self {
        self.echo_endpoints = Some(urls.into_iter().map(Into::into).collect());
        self
    }

    /// Set the user agents used for validation requests.
    pub fn user_agents(mut self, agents: Vec<impl Into<String>>) -> Self {
        self.user_agents = Some(agents.into_iter().map(Into::into).collect());
        self
    }

    /// Set the capacity of the pending and output queues.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Set how often one endpoint may enter validation.
    pub fn usage_quota(mut self, quota: Quota) -> Self {
        self.usage_quota = Some(quota);
        self
    }

    /// Set the base and maximum bad-proxy backoff windows.
    pub fn bad_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.bad_backoff = Some(base);
        self.max_bad_backoff = Some(max);
        self
    }

    /// Set the backlog threshold of the autoscaler.
    pub fn scale_threshold(mut self, threshold: u64) -> Self {
        self.scale_threshold = Some(threshold);
        self
    }

    /// Start with the autoscaler enabled.
    pub fn autoscale(mut self, enabled: bool) -> Self {
        self.autoscale = Some(enabled);
        self
    }

    /// Set the autoscaler tick period.
    pub fn scale_interval(mut self, interval: Duration) -> Self {
        self.scale_interval = Some(interval);
        self
    }

    /// Set how many extra proxies the middleware tries after a failure.
    pub fn dispatch_retries(mut self, count: usize) -> Self {
        self.dispatch_retries = Some(count);
        self
    }

    /// Set how long the middleware waits for a proxy.
    pub fn dispense_timeout(mut self, timeout: Duration) -> Self {
        self.dispense_timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        let two = NonZeroU32::new(2).unwrap_or(NonZeroU32::MIN);
        let default_quota = Quota::with_period(Duration::from_secs(30))
            .map(|q| q.allow_burst(two))
            .unwrap_or_else(|| Quota::per_minute(two));

        let max_workers = self.max_workers.unwrap_or(100);

        PoolConfig {
            stale_after: self.stale_after.unwrap_or(Duration::from_secs(3600)),
            validation_timeout: self.validation_timeout.unwrap_or(Duration::from_secs(9)),
            workers: self.workers.unwrap_or_else(|| max_workers.min(25)),
            max_workers,
            recycle: self.recycle.unwrap_or(true),
            remove_after: self.remove_after.unwrap_or(5),
            echo_endpoints: self
                .echo_endpoints
                .unwrap_or_else(|| DEFAULT_ECHO_ENDPOINTS.iter().map(|s| s.to_string()).collect()),
            user_agents: self
                .user_agents
                .unwrap_or_else(|| DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect()),
            buffer_size: self.buffer_size.unwrap_or(4096),
            usage_quota: self.usage_quota.unwrap_or(default_quota),
            bad_backoff: self.bad_backoff.unwrap_or(Duration::from_secs(60)),
            max_bad_backoff: self.max_bad_backoff.unwrap_or(Duration::from_secs(1800)),
            scale_threshold: self.scale_threshold.unwrap_or(20),
            autoscale: self.autoscale.unwrap_or(false),
            scale_interval: self.scale_interval.unwrap_or(Duration::from_secs(1)),
            dispatch_retries: self.dispatch_retries.unwrap_or(3),
            dispense_timeout: self.dispense_timeout.unwrap_or(Duration::from_secs(30)),
        }
    }
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

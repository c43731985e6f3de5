//! Error types for the socks-proxy-pool crate.

use thiserror::Error;

/// Error returned when no healthy proxy could be obtained from the pool.
#[derive(Debug, Error)]
#[error("No proxy available in pool")]
pub struct NoProxyAvailable;

/// Errors produced by the proxy pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `start` was called on a pool that is already running.
    #[error("proxy pool is already running")]
    AlreadyRunning,

    /// `pause` was called on a pool that is already paused.
    #[error("proxy pool is already paused")]
    AlreadyPaused,

    /// `resume` was called on a pool that is not paused.
    #[error("proxy pool is not paused")]
    NotPaused,

    /// `pause` was called on a pool that was never started.
    #[error("proxy pool is not running")]
    NotRunning,

    /// A configuration change that requires a stopped or paused pool.
    #[error("cannot change {0} while the pool is running")]
    Running(&'static str),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Registry lookup for an endpoint that is not present.
    #[error("endpoint not found: {0}")]
    NotFound(String),

    /// A candidate string that is not a usable `host:port`.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The caller's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Only TCP networks can be dialed through a SOCKS proxy.
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// The worker pool or an output queue was shut down.
    #[error("pool channel closed")]
    Closed,

    /// Dialing through a backing proxy failed.
    #[error("dial via {endpoint} failed: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: tokio_socks::Error,
    },

    /// The connect phase of a dial exceeded the validation timeout.
    #[error("dial via {0} timed out")]
    DialTimeout(String),

    /// An IP echo endpoint answered with something other than an address.
    #[error("echo response is not an IP address: {0:?}")]
    InvalidEcho(String),

    /// The proxy has no negotiated protocol to dial with.
    #[error("protocol of {0} is not known yet")]
    UnknownProtocol(String),

    /// Seed list could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// HTTP client error.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PoolError>;

//! # socks-proxy-pool
//!
//! A self-refreshing pool of SOCKS4, SOCKS4a and SOCKS5 proxies.
//!
//! Candidate `host:port` endpoints are loaded from lists, deduplicated, and
//! validated in the background by a bounded (optionally autoscaled) worker
//! pool that negotiates each proxy's protocol and checks it can reach the
//! internet. Callers take live proxies with the blocking `get_*` methods,
//! dial through them with [`ProxyPool::dial`], or plug the pool into a
//! reqwest client with [`ProxyPoolMiddleware`].

pub mod config;
mod dialer;
mod dispense;
pub mod error;
mod limiter;
pub mod middleware;
pub mod pool;
pub mod proxy;
mod registry;
mod scaler;
mod stats;
pub mod utils;
mod validator;
mod workers;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use dialer::Dialer;
pub use error::{NoProxyAvailable, PoolError, Result};
pub use limiter::{BadProxyLimiter, UsageLimiter};
pub use middleware::ProxyPoolMiddleware;
pub use pool::{ProxyPool, Status};
pub use proxy::{Protocol, Proxy, ProxyEntry, SoftLockGuard};
pub use registry::Registry;
pub use scaler::{AutoScaler, ScalerState};
pub use stats::{Stats, StatsSnapshot};
pub use workers::{Job, TaskPool, WorkerPool};

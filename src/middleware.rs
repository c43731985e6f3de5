//! Middleware implementation for reqwest.

use crate::error::{NoProxyAvailable, PoolError};
use crate::pool::ProxyPool;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;

/// Middleware that sends each request through a proxy dispensed by the pool.
///
/// The pool must be running for requests to get through; a request waits up
/// to the configured dispense timeout for a live proxy.
#[derive(Clone)]
pub struct ProxyPoolMiddleware {
    /// The proxy pool.
    pool: Arc<ProxyPool>,
}

impl ProxyPoolMiddleware {
    pub fn new(pool: Arc<ProxyPool>) -> Self {
        let stats = pool.stats();
        info!(
            "Proxy pool middleware attached ({} validated, {} endpoints known)",
            stats.total_validated(),
            pool.registry_len()
        );
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }
}

#[async_trait]
impl Middleware for ProxyPoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let (max_retries, wait, timeout) = {
            let config = self.pool.config();
            (
                config.dispatch_retries,
                config.dispense_timeout,
                config.validation_timeout,
            )
        };
        let mut retry_count = 0;

        loop {
            let proxy = match self.pool.get_any(tokio::time::sleep(wait)).await {
                Ok(proxy) => proxy,
                Err(PoolError::Cancelled) | Err(PoolError::Closed) => {
                    warn!(
                        "No proxy available after {:?}. Backlog: {}",
                        wait,
                        self.pool.backlog()
                    );
                    return Err(Error::Middleware(anyhow!(NoProxyAvailable)));
                }
                Err(e) => return Err(Error::Middleware(anyhow!(e))),
            };

            let proxied_request = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                        .to_string()
                ))
            })?;

            let proxy_url = proxy.url();
            info!("Using proxy: {} (attempt {})", proxy_url, retry_count + 1);

            let client = match proxy.to_reqwest_proxy().and_then(|p| {
                reqwest::Client::builder()
                    .proxy(p)
                    .timeout(timeout)
                    .build()
            }) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to build client with proxy {}: {}", proxy_url, e);
                    self.pool.report_failure(&proxy.endpoint);
                    retry_count += 1;
                    if retry_count > max_retries {
                        return Err(Error::Reqwest(e));
                    }
                    continue;
                }
            };

            match client.execute(proxied_request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(
                        "Request failed with proxy {} (attempt {}): {}",
                        proxy_url,
                        retry_count + 1,
                        err
                    );
                    self.pool.report_failure(&proxy.endpoint);

                    retry_count += 1;
                    if retry_count > max_retries {
                        return Err(Error::Reqwest(err));
                    }
                }
            }
        }
    }
}

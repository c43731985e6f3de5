//! Validation jobs: protocol negotiation and external reachability checks.

use crate::error::{PoolError, Result};
use crate::pool::{halted, ProxyPool};
use crate::proxy::Protocol;

use log::{debug, info, warn};
use rand::seq::IndexedRandom;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Settings a single validation round needs, copied out of the live config.
struct Probe {
    timeout: Duration,
    echo_endpoints: Vec<String>,
    user_agents: Vec<String>,
}

impl ProxyPool {
    /// Worker job: take one endpoint off the pending queue and validate it.
    ///
    /// Returns without consuming anything if the pool stops running first.
    pub(crate) async fn validate_next(self: Arc<Self>, epoch: u64) {
        let mut run = self.run.subscribe();
        let endpoint = {
            let mut pending = tokio::select! {
                guard = self.pending.rx.lock() => guard,
                _ = halted(&mut run, epoch) => return,
            };
            tokio::select! {
                endpoint = pending.recv() => endpoint,
                _ = halted(&mut run, epoch) => return,
            }
        };
        if let Some(endpoint) = endpoint {
            self.validate(endpoint).await;
        }
    }

    /// One validation round for `endpoint`.
    pub(crate) async fn validate(&self, endpoint: String) {
        let Some(entry) = self.registry.get(&endpoint) else {
            // evicted while queued
            return;
        };

        if let Err(wait) = self.usage.check(&endpoint) {
            debug!("{} throttled, retrying in {:?}", endpoint, wait);
            self.requeue(endpoint, wait);
            return;
        }
        if let Some(wait) = self.bad.retry_after(&endpoint) {
            debug!("{} backed off, retrying in {:?}", endpoint, wait);
            self.requeue(endpoint, wait);
            return;
        }

        self.stats.record_checked();
        let probe = {
            let config = self.config.read();
            Probe {
                timeout: config.validation_timeout,
                echo_endpoints: config.echo_endpoints.clone(),
                user_agents: config.user_agents.clone(),
            }
        };

        for protocol in Protocol::NEGOTIATION_ORDER {
            match probe.check(protocol, &endpoint).await {
                Ok(external_ip) => {
                    let proxy = entry.record_validation(protocol, external_ip);
                    // a protocol negotiated earlier wins over this round's
                    let protocol = proxy.protocol;
                    self.stats.record_valid(protocol);
                    info!("Validated {} as {} (exit {})", endpoint, protocol, external_ip);
                    if let Some(queue) = self.queues.get(protocol) {
                        let _ = queue.tx.send(proxy).await;
                    }
                    return;
                }
                Err(e) => debug!("{} failed {}: {}", endpoint, protocol, e),
            }
        }

        self.stats.record_bad();
        let times_bad = entry.mark_bad();
        let backoff = self.bad.strike(&endpoint);
        if times_bad >= self.config.read().remove_after {
            self.evict(&endpoint);
        } else {
            warn!(
                "{} failed validation ({} bad), retrying in {:?}",
                endpoint, times_bad, backoff
            );
            self.requeue(endpoint, backoff);
        }
    }
}

impl Probe {
    /// Fetch an IP echo page through `endpoint` speaking `protocol`.
    async fn check(&self, protocol: Protocol, endpoint: &str) -> Result<IpAddr> {
        let scheme = protocol
            .scheme()
            .ok_or_else(|| PoolError::UnknownProtocol(endpoint.to_string()))?;
        // plain socks5 here: the echo host is resolved locally for the probe
        let scheme = if protocol == Protocol::Socks5 { "socks5" } else { scheme };

        let (echo_url, agent) = {
            let mut rng = rand::rng();
            let echo_url = self
                .echo_endpoints
                .choose(&mut rng)
                .cloned()
                .ok_or_else(|| PoolError::InvalidConfig("no echo endpoints".into()))?;
            (echo_url, self.user_agents.choose(&mut rng).cloned())
        };

        let mut builder = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("{}://{}", scheme, endpoint))?)
            .timeout(self.timeout)
            .connect_timeout(self.timeout);
        if let Some(agent) = agent {
            builder = builder.user_agent(agent);
        }
        let client = builder.build()?;

        let body = client
            .get(echo_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_echo(&body)
    }
}

/// An echo body must be exactly one IP literal, surrounding whitespace aside.
fn parse_echo(body: &str) -> Result<IpAddr> {
    let trimmed = body.trim();
    trimmed
        .parse::<IpAddr>()
        .map_err(|_| PoolError::InvalidEcho(trimmed.chars().take(64).collect()))
}

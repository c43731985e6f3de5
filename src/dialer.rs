//! Outbound connections through pooled proxies.

use crate::error::{PoolError, Result};
use crate::pool::ProxyPool;
use crate::proxy::{Protocol, Proxy};

use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};

/// Opens tunneled TCP connections through one proxy.
#[derive(Debug, Clone)]
pub struct Dialer {
    protocol: Protocol,
    endpoint: String,
    timeout: Duration,
}

impl Dialer {
    pub fn new(protocol: Protocol, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            protocol,
            endpoint: endpoint.into(),
            timeout,
        }
    }

    /// Dialer for a dispensed proxy.
    pub fn for_proxy(proxy: &Proxy, timeout: Duration) -> Self {
        Self::new(proxy.protocol, proxy.endpoint.clone(), timeout)
    }

    /// Connect to `target` (`host:port`) through the proxy.
    ///
    /// SOCKS4 resolves the target locally; SOCKS4a and SOCKS5 leave name
    /// resolution to the proxy.
    pub async fn connect(&self, target: &str) -> Result<TcpStream> {
        tokio::time::timeout(self.timeout, self.handshake(target))
            .await
            .map_err(|_| PoolError::DialTimeout(self.endpoint.clone()))?
    }

    async fn handshake(&self, target: &str) -> Result<TcpStream> {
        let proxy = self.endpoint.as_str();
        let wrap = |source| PoolError::Dial {
            endpoint: self.endpoint.clone(),
            source,
        };
        match self.protocol {
            Protocol::Socks5 => Socks5Stream::connect(proxy, target)
                .await
                .map(Socks5Stream::into_inner)
                .map_err(wrap),
            Protocol::Socks4a => Socks4Stream::connect(proxy, target)
                .await
                .map(Socks4Stream::into_inner)
                .map_err(wrap),
            Protocol::Socks4 => {
                let addr = tokio::net::lookup_host(target)
                    .await?
                    .find(|addr| addr.is_ipv4())
                    .ok_or_else(|| PoolError::InvalidEndpoint(target.to_string()))?;
                Socks4Stream::connect(proxy, addr)
                    .await
                    .map(Socks4Stream::into_inner)
                    .map_err(wrap)
            }
            Protocol::Unknown => Err(PoolError::UnknownProtocol(self.endpoint.clone())),
        }
    }
}

impl ProxyPool {
    /// Connect to `address` through whichever live proxy the pool hands out,
    /// moving on to the next one when a proxy fails to connect.
    ///
    /// This is the dial function a SOCKS5 front-end server calls per client.
    /// Only TCP networks are supported. When `cancel` resolves the call
    /// returns [`PoolError::Cancelled`] without taking another candidate.
    pub async fn dial<C>(&self, cancel: C, network: &str, address: &str) -> Result<TcpStream>
    where
        C: Future<Output = ()>,
    {
        if !matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(PoolError::UnsupportedNetwork(network.to_string()));
        }
        tokio::pin!(cancel);
        loop {
            let proxy = self.get_any(&mut cancel).await?;
            let timeout = self.config.read().validation_timeout;
            let dialer = Dialer::for_proxy(&proxy, timeout);
            tokio::select! {
                _ = &mut cancel => return Err(PoolError::Cancelled),
                conn = dialer.connect(address) => match conn {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        debug!("dial {} via {} failed: {}", address, proxy.endpoint, e);
                        self.report_failure(&proxy.endpoint);
                    }
                },
            }
        }
    }
}

//! Handing validated proxies to callers.
//!
//! Every `get_*` call blocks until a proxy passes the still-good gate or the
//! caller's cancellation future resolves. Candidates failing the gate are
//! discarded from the output queue; with recycling on they go back to the
//! pending queue for another validation round.

use crate::error::{PoolError, Result};
use crate::pool::ProxyPool;
use crate::proxy::{Protocol, Proxy};

use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;

impl ProxyPool {
    /// Wait for a live SOCKS5 proxy.
    pub async fn get_socks5<C>(&self, cancel: C) -> Result<Proxy>
    where
        C: Future<Output = ()>,
    {
        self.dispense(Some(Protocol::Socks5), cancel).await
    }

    /// Wait for a live SOCKS4 proxy.
    pub async fn get_socks4<C>(&self, cancel: C) -> Result<Proxy>
    where
        C: Future<Output = ()>,
    {
        self.dispense(Some(Protocol::Socks4), cancel).await
    }

    /// Wait for a live SOCKS4a proxy.
    pub async fn get_socks4a<C>(&self, cancel: C) -> Result<Proxy>
    where
        C: Future<Output = ()>,
    {
        self.dispense(Some(Protocol::Socks4a), cancel).await
    }

    /// Wait for a live proxy of any version, whichever queue yields first.
    pub async fn get_any<C>(&self, cancel: C) -> Result<Proxy>
    where
        C: Future<Output = ()>,
    {
        self.dispense(None, cancel).await
    }

    async fn dispense<C>(&self, wanted: Option<Protocol>, cancel: C) -> Result<Proxy>
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        loop {
            let candidate = tokio::select! {
                _ = &mut cancel => return Err(PoolError::Cancelled),
                candidate = self.next_candidate(wanted) => candidate?,
            };
            let verdict = tokio::select! {
                _ = &mut cancel => None,
                checked = self.still_good(&candidate) => Some(checked),
            };
            match verdict {
                Some(Some(proxy)) => {
                    self.stats.record_dispensed();
                    return Ok(proxy);
                }
                Some(None) => continue,
                None => {
                    self.restore(candidate);
                    return Err(PoolError::Cancelled);
                }
            }
        }
    }

    /// Put back a candidate whose check was interrupted by cancellation.
    fn restore(&self, candidate: Proxy) {
        if let Some(queue) = self.queues.get(candidate.protocol) {
            if queue.tx.try_send(candidate).is_err() {
                debug!("output queue full, dropping interrupted candidate");
            }
        }
    }

    async fn next_candidate(&self, wanted: Option<Protocol>) -> Result<Proxy> {
        let received = match wanted.and_then(|p| self.queues.get(p)) {
            Some(queue) => queue.recv().await,
            None => tokio::select! {
                Some(proxy) = self.queues.socks5.recv() => Some(proxy),
                Some(proxy) = self.queues.socks4.recv() => Some(proxy),
                Some(proxy) = self.queues.socks4a.recv() => Some(proxy),
                else => None,
            },
        };
        received.ok_or(PoolError::Closed)
    }

    /// Re-check a queued candidate right before handing it out.
    ///
    /// The soft lock is held for the whole check and the final copy. Dropping
    /// the future midway releases it.
    pub(crate) async fn still_good(&self, candidate: &Proxy) -> Option<Proxy> {
        let endpoint = candidate.endpoint.as_str();
        let entry = self.registry.get(endpoint)?;
        let guard = entry.try_lock()?;

        let (remove_after, timeout, stale_after, recycle) = {
            let config = self.config.read();
            (
                config.remove_after,
                config.validation_timeout,
                config.stale_after,
                config.recycle,
            )
        };

        if guard.entry().times_bad() >= remove_after {
            drop(guard);
            self.evict(endpoint);
            return None;
        }

        let good = if self.bad.peek(endpoint) {
            debug!("{} is backed off, skipping", endpoint);
            false
        } else if guard
            .entry()
            .last_validated()
            .map_or(true, |at| at.elapsed() > stale_after)
        {
            debug!("{} is stale, skipping", endpoint);
            self.stats.record_stale();
            false
        } else if !redial(endpoint, timeout).await {
            debug!("{} no longer accepts connections", endpoint);
            guard.entry().mark_bad();
            false
        } else {
            true
        };

        if recycle {
            self.requeue(endpoint.to_string(), Duration::ZERO);
        }

        good.then(|| guard.snapshot())
    }
}

async fn redial(endpoint: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_test::{assert_pending, task};

    fn config(recycle: bool) -> PoolConfig {
        PoolConfig::builder()
            .echo_endpoints(vec!["http://127.0.0.1:9/"])
            .validation_timeout(Duration::from_millis(500))
            .stale_after(Duration::from_secs(60))
            .remove_after(3)
            .recycle(recycle)
            .build()
    }

    /// A listener that accepts and drops connections, standing in for a proxy.
    async fn live_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        addr.to_string()
    }

    /// An endpoint whose accept queue is full, so new connects hang.
    /// Keep the returned listener and streams alive for the test's duration.
    async fn unresponsive_endpoint() -> (String, tokio::net::TcpListener, Vec<TcpStream>) {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut held = Vec::new();
        for _ in 0..16 {
            match tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => held.push(stream),
                _ => break,
            }
        }
        (addr.to_string(), listener, held)
    }

    /// Register `endpoint` as validated and put a copy on its output queue.
    async fn seed(pool: &Arc<ProxyPool>, endpoint: &str, protocol: Protocol) -> Proxy {
        let (entry, _) = pool.registry.add(endpoint);
        let proxy = entry.record_validation(protocol, IpAddr::V4(Ipv4Addr::LOCALHOST));
        pool.stats.record_valid(protocol);
        pool.queues.get(protocol).unwrap().tx.send(proxy.clone()).await.unwrap();
        proxy
    }

    #[tokio::test]
    async fn dispenses_live_fresh_proxy() {
        let pool = ProxyPool::new(config(false)).unwrap();
        let endpoint = live_endpoint().await;
        seed(&pool, &endpoint, Protocol::Socks5).await;

        let proxy = pool.get_socks5(std::future::pending()).await.unwrap();
        assert_eq!(proxy.endpoint, endpoint);
        assert_eq!(proxy.protocol, Protocol::Socks5);
        assert_eq!(pool.stats().dispensed, 1);
        assert!(!pool.registry.get(&endpoint).unwrap().is_locked());
    }

    #[tokio::test]
    async fn stale_proxy_is_rejected() {
        let pool = ProxyPool::new(config(false)).unwrap();
        let endpoint = live_endpoint().await;
        let proxy = seed(&pool, &endpoint, Protocol::Socks4).await;
        pool.registry.get(&endpoint).unwrap().backdate(Duration::from_secs(120));

        assert!(pool.still_good(&proxy).await.is_none());
        assert_eq!(pool.stats().stale, 1);
        assert!(!pool.registry.get(&endpoint).unwrap().is_locked());
    }

    #[tokio::test]
    async fn busy_entry_is_skipped() {
        let pool = ProxyPool::new(config(false)).unwrap();
        let endpoint = live_endpoint().await;
        let proxy = seed(&pool, &endpoint, Protocol::Socks5).await;
        let entry = pool.registry.get(&endpoint).unwrap();

        let held = entry.try_lock().unwrap();
        assert!(pool.still_good(&proxy).await.is_none());
        drop(held);
        assert!(pool.still_good(&proxy).await.is_some());
    }

    #[tokio::test]
    async fn bad_count_at_threshold_evicts() {
        let pool = ProxyPool::new(config(false)).unwrap();
        let endpoint = live_endpoint().await;
        let proxy = seed(&pool, &endpoint, Protocol::Socks5).await;
        let entry = pool.registry.get(&endpoint).unwrap();
        for _ in 0..3 {
            entry.mark_bad();
        }

        assert!(pool.still_good(&proxy).await.is_none());
        assert!(!pool.exists(&endpoint));
        assert_eq!(pool.stats().evicted, 1);
    }

    #[tokio::test]
    async fn backed_off_proxy_is_rejected() {
        let pool = ProxyPool::new(config(false)).unwrap();
        let endpoint = live_endpoint().await;
        let proxy = seed(&pool, &endpoint, Protocol::Socks5).await;
        pool.bad.strike(&endpoint);
        assert!(pool.still_good(&proxy).await.is_none());
        assert!(pool.exists(&endpoint));
    }

    #[tokio::test]
    async fn dead_proxy_is_rejected_and_marked_bad() {
        let pool = ProxyPool::new(config(false)).unwrap();
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = closed.local_addr().unwrap().to_string();
        drop(closed);
        let proxy = seed(&pool, &endpoint, Protocol::Socks5).await;

        assert!(pool.still_good(&proxy).await.is_none());
        assert_eq!(pool.registry.get(&endpoint).unwrap().times_bad(), 1);
    }

    #[tokio::test]
    async fn stale_dead_proxy_counts_as_stale() {
        let pool = ProxyPool::new(config(false)).unwrap();
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = closed.local_addr().unwrap().to_string();
        drop(closed);
        let proxy = seed(&pool, &endpoint, Protocol::Socks5).await;
        pool.registry.get(&endpoint).unwrap().backdate(Duration::from_secs(120));

        assert!(pool.still_good(&proxy).await.is_none());
        assert_eq!(pool.stats().stale, 1);
        // rejected before any connection attempt
        assert_eq!(pool.registry.get(&endpoint).unwrap().times_bad(), 0);
    }

    #[tokio::test]
    async fn cancel_interrupts_recheck_and_keeps_candidate() {
        let config = PoolConfig::builder()
            .echo_endpoints(vec!["http://127.0.0.1:9/"])
            .validation_timeout(Duration::from_secs(3))
            .recycle(false)
            .build();
        let pool = ProxyPool::new(config).unwrap();
        let (endpoint, _listener, _held) = unresponsive_endpoint().await;
        seed(&pool, &endpoint, Protocol::Socks5).await;

        let started = std::time::Instant::now();
        let res = pool
            .get_socks5(tokio::time::sleep(Duration::from_millis(100)))
            .await;
        assert!(matches!(res, Err(PoolError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.queue_len(Protocol::Socks5), 1);
        assert!(!pool.registry.get(&endpoint).unwrap().is_locked());
        assert_eq!(pool.stats().dispensed, 0);
    }

    #[tokio::test]
    async fn recycling_requeues_regardless_of_outcome() {
        let pool = ProxyPool::new(config(true)).unwrap();
        let endpoint = live_endpoint().await;
        let proxy = seed(&pool, &endpoint, Protocol::Socks5).await;
        pool.registry.get(&endpoint).unwrap().backdate(Duration::from_secs(120));

        assert!(pool.still_good(&proxy).await.is_none());
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.pending_len() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(pool.pending.recv().await.as_deref(), Some(endpoint.as_str()));
    }

    #[tokio::test]
    async fn handed_out_copy_is_independent() {
        let pool = ProxyPool::new(config(false)).unwrap();
        let endpoint = live_endpoint().await;
        seed(&pool, &endpoint, Protocol::Socks5).await;
        let mut proxy = pool.get_any(std::future::pending()).await.unwrap();
        proxy.times_bad = 42;
        proxy.protocol = Protocol::Socks4;
        let entry = pool.registry.get(&endpoint).unwrap();
        assert_eq!(entry.times_bad(), 0);
        assert_eq!(entry.protocol(), Protocol::Socks5);
    }

    #[tokio::test]
    async fn get_any_takes_from_every_queue() {
        let pool = ProxyPool::new(config(false)).unwrap();
        let a = live_endpoint().await;
        let b = live_endpoint().await;
        seed(&pool, &a, Protocol::Socks4).await;
        seed(&pool, &b, Protocol::Socks4a).await;

        let mut got = vec![
            pool.get_any(std::future::pending()).await.unwrap().endpoint,
            pool.get_any(std::future::pending()).await.unwrap().endpoint,
        ];
        got.sort();
        let mut want = vec![a, b];
        want.sort();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn empty_pool_blocks_until_cancelled() {
        let pool = ProxyPool::new(config(false)).unwrap();
        let mut waiting = task::spawn(pool.get_any(std::future::pending()));
        assert_pending!(waiting.poll());

        let res = pool
            .get_socks4(tokio::time::sleep(Duration::from_millis(20)))
            .await;
        assert!(matches!(res, Err(PoolError::Cancelled)));
    }
}

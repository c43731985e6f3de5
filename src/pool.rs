//! Core proxy pool: intake, queues and the Start/Pause/Resume lifecycle.
//!
//! Raw endpoints are deduplicated by the [`Registry`] as they are loaded,
//! travel through an unbounded intake queue and a bounded pending queue, and
//! are validated by jobs running on the [`WorkerPool`]. Validated copies land
//! on one output queue per protocol, from which the dispenser serves callers.

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::limiter::{BadProxyLimiter, UsageLimiter};
use crate::proxy::{Protocol, Proxy};
use crate::registry::Registry;
use crate::scaler::{AutoScaler, ScalerState};
use crate::stats::{Stats, StatsSnapshot};
use crate::utils;
use crate::workers::{Job, TaskPool, WorkerPool};

use log::{error, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};

/// Lifecycle status of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Running,
    Paused,
}

/// Status plus the launch generation of the background loops. A loop only
/// keeps going while the pool is running under the epoch it was started with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunState {
    status: Status,
    epoch: u64,
}

/// Resolves once the loops of `epoch` should stop.
pub(crate) async fn halted(run: &mut watch::Receiver<RunState>, epoch: u64) {
    loop {
        let state = *run.borrow_and_update();
        if state.status != Status::Running || state.epoch != epoch {
            return;
        }
        if run.changed().await.is_err() {
            return;
        }
    }
}

/// Bounded multi-consumer queue.
pub(crate) struct Queue<T> {
    pub(crate) tx: mpsc::Sender<T>,
    pub(crate) rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> Queue<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub(crate) async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    pub(crate) fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

pub(crate) struct OutputQueues {
    pub(crate) socks4: Queue<Proxy>,
    pub(crate) socks4a: Queue<Proxy>,
    pub(crate) socks5: Queue<Proxy>,
}

impl OutputQueues {
    pub(crate) fn get(&self, protocol: Protocol) -> Option<&Queue<Proxy>> {
        match protocol {
            Protocol::Socks4 => Some(&self.socks4),
            Protocol::Socks4a => Some(&self.socks4a),
            Protocol::Socks5 => Some(&self.socks5),
            Protocol::Unknown => None,
        }
    }
}

/// A self-refreshing pool of validated SOCKS proxies.
pub struct ProxyPool {
    pub(crate) config: RwLock<PoolConfig>,
    pub(crate) registry: Registry,
    pub(crate) stats: Stats,
    pub(crate) usage: UsageLimiter,
    pub(crate) bad: BadProxyLimiter,
    pub(crate) scaler: AutoScaler,
    pub(crate) workers: Arc<dyn WorkerPool>,
    pub(crate) run: watch::Sender<RunState>,
    intake_tx: mpsc::UnboundedSender<String>,
    intake_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    pub(crate) pending: Queue<String>,
    pub(crate) queues: OutputQueues,
}

impl ProxyPool {
    /// Create a stopped pool with its own tokio-backed worker pool.
    pub fn new(config: PoolConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let workers = Arc::new(TaskPool::new(config.workers));
        Self::with_workers(config, workers)
    }

    /// Create a stopped pool that schedules validation on `workers`.
    pub fn with_workers(config: PoolConfig, workers: Arc<dyn WorkerPool>) -> Result<Arc<Self>> {
        config.validate()?;
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (run, _) = watch::channel(RunState {
            status: Status::Stopped,
            epoch: 0,
        });
        let scaler = AutoScaler::new(config.scale_threshold, config.max_workers);
        if config.autoscale {
            scaler.enable();
        }

        Ok(Arc::new(Self {
            registry: Registry::new(),
            stats: Stats::new(),
            usage: UsageLimiter::new(config.usage_quota),
            bad: BadProxyLimiter::new(config.bad_backoff, config.max_bad_backoff),
            scaler,
            workers,
            run,
            intake_tx,
            intake_rx: Mutex::new(intake_rx),
            pending: Queue::new(config.buffer_size),
            queues: OutputQueues {
                socks4: Queue::new(config.buffer_size),
                socks4a: Queue::new(config.buffer_size),
                socks5: Queue::new(config.buffer_size),
            },
            config: RwLock::new(config),
        }))
    }

    /// Queue one raw `host:port` candidate for validation.
    ///
    /// Returns `Ok(false)` when the endpoint is already known.
    pub fn load(&self, raw: &str) -> Result<bool> {
        let endpoint = utils::normalize_endpoint(raw)
            .ok_or_else(|| PoolError::InvalidEndpoint(raw.trim().to_string()))?;
        let (_, created) = self.registry.add(&endpoint);
        if created {
            // the receiver lives as long as self
            let _ = self.intake_tx.send(endpoint);
        }
        Ok(created)
    }

    /// Load newline-delimited candidates. Returns how many were new.
    pub fn load_list(&self, content: &str) -> usize {
        let added = utils::parse_endpoint_list(content)
            .iter()
            .filter(|endpoint| matches!(self.load(endpoint), Ok(true)))
            .count();
        info!("Loaded {} new endpoints", added);
        added
    }

    /// Load candidates from a URL or a local file.
    pub async fn load_from_source(&self, source: &str) -> Result<usize> {
        let endpoints = utils::fetch_endpoints_from_source(source).await?;
        info!("Fetched {} endpoints from {}", endpoints.len(), source);
        Ok(endpoints
            .iter()
            .filter(|endpoint| matches!(self.load(endpoint), Ok(true)))
            .count())
    }

    /// Put an already registered endpoint back on the pending queue after `delay`.
    pub(crate) fn requeue(&self, endpoint: String, delay: Duration) {
        let tx = self.pending.tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(endpoint).await;
        });
    }

    /// Remove an endpoint for good. Its address may be loaded again later.
    pub(crate) fn evict(&self, endpoint: &str) {
        if self.registry.delete(endpoint).is_ok() {
            self.bad.forget(endpoint);
            self.usage.prune();
            self.stats.record_evicted();
            warn!("Evicted proxy {}", endpoint);
        }
    }

    /// Report a proxy that misbehaved after being dispensed.
    pub fn report_failure(&self, endpoint: &str) {
        let Some(entry) = self.registry.get(endpoint) else {
            return;
        };
        let times_bad = entry.mark_bad();
        self.bad.strike(endpoint);
        if times_bad >= self.config.read().remove_after {
            self.evict(endpoint);
        }
    }

    pub fn status(&self) -> Status {
        self.run.borrow().status
    }

    /// Launch the intake, job-spawning and autoscaler loops.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let epoch = self.transition(|status| match status {
            Status::Running => Err(PoolError::AlreadyRunning),
            Status::Stopped | Status::Paused => Ok(Status::Running),
        })?;
        self.launch(epoch);
        info!("Proxy pool started");
        Ok(())
    }

    /// Stop the background loops. Jobs already running are left to finish
    /// and may still deliver proxies.
    pub fn pause(&self) -> Result<()> {
        self.transition(|status| match status {
            Status::Running => Ok(Status::Paused),
            Status::Paused => Err(PoolError::AlreadyPaused),
            Status::Stopped => Err(PoolError::NotRunning),
        })?;
        info!("Proxy pool paused");
        Ok(())
    }

    /// Relaunch the background loops of a paused pool.
    pub fn resume(self: &Arc<Self>) -> Result<()> {
        let epoch = self.transition(|status| match status {
            Status::Paused => Ok(Status::Running),
            _ => Err(PoolError::NotPaused),
        })?;
        self.launch(epoch);
        info!("Proxy pool resumed");
        Ok(())
    }

    /// Atomically move to the status chosen by `next`, returning the new epoch.
    fn transition(&self, next: impl FnOnce(Status) -> Result<Status>) -> Result<u64> {
        let mut outcome = Err(PoolError::NotRunning);
        self.run.send_if_modified(|state| match next(state.status) {
            Ok(status) => {
                if status == Status::Running {
                    state.epoch += 1;
                }
                state.status = status;
                outcome = Ok(state.epoch);
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome
    }

    fn launch(self: &Arc<Self>, epoch: u64) {
        tokio::spawn(Arc::clone(self).intake_loop(epoch));
        tokio::spawn(Arc::clone(self).spawn_loop(epoch));
        tokio::spawn(Arc::clone(self).scale_loop(epoch));
    }

    /// Moves freshly loaded endpoints onto the bounded pending queue.
    async fn intake_loop(self: Arc<Self>, epoch: u64) {
        let mut run = self.run.subscribe();
        let mut intake = tokio::select! {
            guard = self.intake_rx.lock() => guard,
            _ = halted(&mut run, epoch) => return,
        };
        loop {
            let endpoint = tokio::select! {
                endpoint = intake.recv() => match endpoint {
                    Some(endpoint) => endpoint,
                    None => return,
                },
                _ = halted(&mut run, epoch) => return,
            };
            tokio::select! {
                permit = self.pending.tx.reserve() => match permit {
                    Ok(permit) => permit.send(endpoint),
                    Err(_) => return,
                },
                _ = halted(&mut run, epoch) => {
                    // hand it to whichever intake loop runs next
                    let _ = self.intake_tx.send(endpoint);
                    return;
                }
            }
        }
    }

    /// Keeps the worker pool saturated with validation jobs.
    async fn spawn_loop(self: Arc<Self>, epoch: u64) {
        let mut run = self.run.subscribe();
        loop {
            let job: Job = Box::pin(Arc::clone(&self).validate_next(epoch));
            tokio::select! {
                submitted = self.workers.submit(job) => {
                    if let Err(e) = submitted {
                        error!("Job spawner stopping: {}", e);
                        return;
                    }
                }
                _ = halted(&mut run, epoch) => return,
            }
        }
    }

    async fn scale_loop(self: Arc<Self>, epoch: u64) {
        let mut run = self.run.subscribe();
        let period = self.config.read().scale_interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scaler.tick(self.stats.backlog(), self.workers.as_ref());
                }
                _ = halted(&mut run, epoch) => return,
            }
        }
    }

    /// Current configuration.
    pub fn config(&self) -> PoolConfig {
        self.config.read().clone()
    }

    pub fn set_stale_after(&self, age: Duration) {
        self.config.write().stale_after = age;
    }

    pub fn set_validation_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(PoolError::InvalidConfig("validation_timeout must be non-zero".into()));
        }
        self.config.write().validation_timeout = timeout;
        Ok(())
    }

    pub fn set_recycling(&self, enabled: bool) {
        self.config.write().recycle = enabled;
    }

    pub fn set_remove_after(&self, count: u64) -> Result<()> {
        if count == 0 {
            return Err(PoolError::InvalidConfig("remove_after must be at least 1".into()));
        }
        self.config.write().remove_after = count;
        Ok(())
    }

    pub fn set_echo_endpoints(&self, urls: Vec<String>) -> Result<()> {
        if urls.is_empty() {
            return Err(PoolError::InvalidConfig("at least one echo endpoint is required".into()));
        }
        self.config.write().echo_endpoints = urls;
        Ok(())
    }

    pub fn set_user_agents(&self, agents: Vec<String>) {
        self.config.write().user_agents = agents;
    }

    /// Change the worker ceiling. Rejected while running.
    pub fn set_max_workers(&self, max: usize) -> Result<()> {
        if self.status() == Status::Running {
            return Err(PoolError::Running("max workers"));
        }
        if max == 0 {
            return Err(PoolError::InvalidConfig("max_workers must be at least 1".into()));
        }
        let mut config = self.config.write();
        config.max_workers = max;
        config.workers = config.workers.min(max);
        self.scaler.set_max(max);
        let capacity = self.workers.capacity();
        if capacity > max {
            self.workers.tune(max as isize - capacity as isize);
        }
        Ok(())
    }

    /// Resize the worker pool directly. Rejected while running.
    pub fn set_workers(&self, count: usize) -> Result<()> {
        if self.status() == Status::Running {
            return Err(PoolError::Running("worker count"));
        }
        let mut config = self.config.write();
        if count == 0 || count > config.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "workers must be within 1..={}",
                config.max_workers
            )));
        }
        config.workers = count;
        let capacity = self.workers.capacity();
        self.workers.tune(count as isize - capacity as isize);
        Ok(())
    }

    pub fn set_scale_threshold(&self, threshold: u64) {
        self.config.write().scale_threshold = threshold;
        self.scaler.set_threshold(threshold);
    }

    pub fn enable_autoscaler(&self) {
        self.config.write().autoscale = true;
        self.scaler.enable();
    }

    pub fn disable_autoscaler(&self) {
        self.config.write().autoscale = false;
        self.scaler.disable();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn total_validated(&self) -> u64 {
        self.stats.total_validated()
    }

    pub fn backlog(&self) -> u64 {
        self.stats.backlog()
    }

    pub fn uptime(&self) -> Duration {
        self.stats.uptime()
    }

    pub fn exists(&self, endpoint: &str) -> bool {
        self.registry.exists(endpoint)
    }

    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }

    /// Endpoints waiting for a validation worker.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Validated proxies waiting on the output queue of `protocol`.
    pub fn queue_len(&self, protocol: Protocol) -> usize {
        self.queues.get(protocol).map(Queue::len).unwrap_or(0)
    }

    pub fn worker_capacity(&self) -> usize {
        self.workers.capacity()
    }

    pub fn scaler_state(&self) -> ScalerState {
        self.scaler.state()
    }

    /// Endpoints currently backed off, with strike count and backoff deadline.
    pub fn bad_proxies(&self) -> Vec<(String, u32, Instant)> {
        self.bad.snapshot()
    }

    /// Number of endpoints tracked by the usage limiter.
    pub fn usage_tracked(&self) -> usize {
        self.usage.len()
    }
}

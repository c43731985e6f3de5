//! Resizable bounded executor for validation jobs.

use crate::error::{PoolError, Result};

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A unit of work run by a [`WorkerPool`].
pub type Job = BoxFuture<'static, ()>;

/// Bounded-concurrency executor the pool schedules validation on.
///
/// The autoscaler and the job spawner only use this contract, so any
/// executor with a resizable concurrency limit can be plugged in.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Run `job`, waiting for a free slot first.
    async fn submit(&self, job: Job) -> Result<()>;

    /// Grow or shrink the concurrency limit by `delta`.
    fn tune(&self, delta: isize);

    /// Current concurrency limit.
    fn capacity(&self) -> usize;

    fn is_closed(&self) -> bool;
}

#[derive(Debug)]
struct Slots {
    capacity: AtomicUsize,
    running: AtomicUsize,
    closed: AtomicBool,
    freed: Notify,
}

impl Slots {
    fn try_reserve(&self) -> bool {
        let mut running = self.running.load(Ordering::Acquire);
        loop {
            if running >= self.capacity.load(Ordering::Acquire) {
                return false;
            }
            match self.running.compare_exchange_weak(
                running,
                running + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => running = current,
            }
        }
    }
}

struct SlotRelease(Arc<Slots>);

impl Drop for SlotRelease {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::AcqRel);
        self.0.freed.notify_waiters();
    }
}

/// [`WorkerPool`] spawning each job as a tokio task.
///
/// Shrinking never interrupts running jobs; the new limit applies to the
/// next submission.
#[derive(Debug, Clone)]
pub struct TaskPool {
    slots: Arc<Slots>,
}

impl TaskPool {
    /// Create a pool allowing `capacity` concurrent jobs (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Slots {
                capacity: AtomicUsize::new(capacity.max(1)),
                running: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                freed: Notify::new(),
            }),
        }
    }

    /// Jobs currently executing.
    pub fn running(&self) -> usize {
        self.slots.running.load(Ordering::Acquire)
    }

    /// Stop accepting jobs. Running jobs are left to finish.
    pub fn close(&self) {
        self.slots.closed.store(true, Ordering::Release);
        self.slots.freed.notify_waiters();
    }
}

#[async_trait]
impl WorkerPool for TaskPool {
    async fn submit(&self, job: Job) -> Result<()> {
        loop {
            let freed = self.slots.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if self.is_closed() {
                return Err(PoolError::Closed);
            }
            if self.slots.try_reserve() {
                let release = SlotRelease(Arc::clone(&self.slots));
                tokio::spawn(async move {
                    let _release = release;
                    job.await;
                });
                return Ok(());
            }
            freed.await;
        }
    }

    fn tune(&self, delta: isize) {
        let _ = self
            .slots
            .capacity
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cap| {
                Some(cap.saturating_add_signed(delta).max(1))
            });
        if delta > 0 {
            self.slots.freed.notify_waiters();
        }
    }

    fn capacity(&self) -> usize {
        self.slots.capacity.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.slots.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn tune_never_drops_below_one() {
        let pool = TaskPool::new(2);
        pool.tune(-5);
        assert_eq!(pool.capacity(), 1);
        pool.tune(3);
        assert_eq!(pool.capacity(), 4);
    }

    #[tokio::test]
    async fn submit_waits_for_a_free_slot() {
        let pool = TaskPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        assert_ok!(
            pool.submit(Box::pin(async move {
                let _ = release_rx.await;
            }))
            .await
        );
        assert_eq!(pool.running(), 1);

        let second = pool.submit(Box::pin(async {}));
        tokio::pin!(second);
        assert!(tokio::time::timeout(Duration::from_millis(50), second.as_mut())
            .await
            .is_err());

        release_tx.send(()).unwrap();
        assert_ok!(tokio::time::timeout(Duration::from_secs(1), second).await.unwrap());
    }

    #[tokio::test]
    async fn growing_wakes_blocked_submitters() {
        let pool = TaskPool::new(1);
        let (_hold_tx, hold_rx) = oneshot::channel::<()>();
        pool.submit(Box::pin(async move {
            let _ = hold_rx.await;
        }))
        .await
        .unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(Box::pin(async {})).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.tune(1);
        let res = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(res, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn closed_pool_rejects_jobs() {
        let pool = TaskPool::new(4);
        pool.close();
        assert!(pool.is_closed());
        assert_err!(pool.submit(Box::pin(async {})).await);
    }
}

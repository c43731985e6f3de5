//! Hysteretic sizing of the validation worker pool.
//!
//! Each tick compares the backlog (validated minus dispensed) to a threshold.
//! A low backlog means consumers drain proxies faster than they are produced,
//! so the pool grows one worker per tick; once the backlog recovers the pool
//! shrinks back toward the capacity it had when the episode began. Reversing
//! direction from scaling down to scaling up always passes through `Idle`.

use crate::workers::WorkerPool;

use log::{debug, info};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalerState {
    Disabled,
    Idle,
    ScalingUp,
    ScalingDown,
}

#[derive(Debug)]
struct Inner {
    state: ScalerState,
    baseline: Option<usize>,
    threshold: u64,
    max: usize,
}

/// Worker pool autoscaler.
#[derive(Debug)]
pub struct AutoScaler {
    inner: Mutex<Inner>,
}

impl AutoScaler {
    pub fn new(threshold: u64, max: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ScalerState::Disabled,
                baseline: None,
                threshold,
                max: max.max(1),
            }),
        }
    }

    pub fn enable(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ScalerState::Disabled {
            inner.state = ScalerState::Idle;
        }
    }

    /// Stop scaling. Later ticks walk the capacity back to the baseline.
    pub fn disable(&self) {
        self.inner.lock().state = ScalerState::Disabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().state != ScalerState::Disabled
    }

    pub fn state(&self) -> ScalerState {
        self.inner.lock().state
    }

    pub fn baseline(&self) -> Option<usize> {
        self.inner.lock().baseline
    }

    pub fn set_threshold(&self, threshold: u64) {
        self.inner.lock().threshold = threshold;
    }

    pub fn set_max(&self, max: usize) {
        self.inner.lock().max = max.max(1);
    }

    /// Advance the state machine once. Returns the capacity change applied.
    pub fn tick(&self, backlog: u64, pool: &dyn WorkerPool) -> isize {
        if pool.is_closed() {
            return 0;
        }
        let mut inner = self.inner.lock();
        let capacity = pool.capacity();

        if inner.state == ScalerState::Disabled {
            let Some(baseline) = inner.baseline else {
                return 0;
            };
            let delta = match capacity.cmp(&baseline) {
                std::cmp::Ordering::Less => 1,
                std::cmp::Ordering::Greater => -1,
                std::cmp::Ordering::Equal => {
                    inner.baseline = None;
                    return 0;
                }
            };
            return Self::apply(&inner, pool, capacity, delta);
        }

        let need_up = backlog < inner.threshold && capacity < inner.max;
        let need_down = match inner.baseline {
            Some(baseline) => backlog > inner.threshold && capacity > baseline,
            None => false,
        };

        let (next, delta) = match inner.state {
            ScalerState::Idle if need_up => {
                if inner.baseline.is_none() {
                    inner.baseline = Some(capacity);
                }
                (ScalerState::ScalingUp, 1)
            }
            ScalerState::ScalingUp if need_up => (ScalerState::ScalingUp, 1),
            ScalerState::Idle | ScalerState::ScalingUp | ScalerState::ScalingDown if need_down => {
                (ScalerState::ScalingDown, -1)
            }
            _ => {
                if let Some(baseline) = inner.baseline {
                    if capacity <= baseline && !need_up {
                        inner.baseline = None;
                    }
                }
                (ScalerState::Idle, 0)
            }
        };

        if next != inner.state {
            debug!("autoscaler {:?} -> {:?} (backlog {})", inner.state, next, backlog);
        }
        inner.state = next;
        Self::apply(&inner, pool, capacity, delta)
    }

    fn apply(inner: &Inner, pool: &dyn WorkerPool, capacity: usize, delta: isize) -> isize {
        if delta == 0 {
            return 0;
        }
        let target = capacity.saturating_add_signed(delta).clamp(1, inner.max);
        let applied = target as isize - capacity as isize;
        if applied != 0 {
            pool.tune(applied);
            info!("worker pool resized {} -> {}", capacity, target);
        }
        applied
    }
}

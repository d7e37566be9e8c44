//! # Rate Limiter Optimizer
//!
//! A closed control loop that tunes the shared [`RateLimiter`] so observed
//! p99 latency stays under the configured read/write budgets.
//!
//! ## Phases
//!
//! - **Step**: each [`execute`](RateLimiterOptimizer::execute) raises the rate
//!   by `initial / 10` until the configured rate is reached, then switches to
//!   **Optimize**. This avoids hitting the cluster with full throughput at once.
//! - **Optimize**: each call compares the critical latency against its budget
//!   and computes a candidate rate with [`next_value`](RateLimiterOptimizer::next_value):
//!   a 10% cut above budget, a hold inside the top 10% of the budget, a
//!   cube-root-shaped increase (capped at 5%) below it.
//!
//! A candidate is only committed while the limiter is actually the
//! bottleneck, i.e. current throughput is at least 90% of the current rate.
//! Otherwise both increases and decreases are suppressed.
//!
//! [`OptimizerTask`] drives `execute` from a dedicated timer thread.


use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::limiter::RateLimiter;
use crate::metrics::Metrics;

/// Below this many recorded operations the optimizer has no signal.
pub const MIN_OPERATIONS: u64 = 100;

/// Fraction of the current rate throughput must reach before the rate is changed.
const UTILIZATION_THRESHOLD: f64 = 0.90;

/// Latency/budget ratio above which the rate is held.
const HOLD_RATIO: f64 = 0.90;

const BACKOFF_FACTOR: f64 = 0.90;

const MAX_INCREASE_FACTOR: f64 = 1.05;

// ------------------------------------------------------------------------------------------------
// Inputs
// ------------------------------------------------------------------------------------------------

/// What the optimizer reads from the running system.
pub trait OptimizerInputs: Send + Sync {
    fn mutation_count(&self) -> u64;
    fn select_count(&self) -> u64;
    fn deletion_count(&self) -> u64;
    fn populate_count(&self) -> u64;

    fn total_operations(&self) -> u64 {
        self.mutation_count() + self.select_count() + self.deletion_count() + self.populate_count()
    }

    /// Sum of per-kind ops/sec over the throughput windows.
    fn current_total_throughput(&self) -> f64;

    /// p99 latencies in milliseconds.
    fn read_latency_ms(&self) -> f64;
    fn write_latency_ms(&self) -> f64;
    fn populate_latency_ms(&self) -> f64;
}

impl OptimizerInputs for Metrics {
    fn mutation_count(&self) -> u64 {
        self.mutations().count()
    }

    fn select_count(&self) -> u64 {
        self.selects().count()
    }

    fn deletion_count(&self) -> u64 {
        self.deletions().count()
    }

    fn populate_count(&self) -> u64 {
        self.populate().count()
    }

    fn current_total_throughput(&self) -> f64 {
        self.mutation_throughput()
            + self.select_throughput()
            + self.deletion_throughput()
            + self.populate_throughput()
    }

    fn read_latency_ms(&self) -> f64 {
        self.selects().p99_millis()
    }

    fn write_latency_ms(&self) -> f64 {
        self.mutations().p99_millis()
    }

    fn populate_latency_ms(&self) -> f64 {
        self.populate().p99_millis()
    }
}

// ------------------------------------------------------------------------------------------------
// Optimizer
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerPhase {
    Step,
    Optimize,
}

pub struct RateLimiterOptimizer {
    limiter: Arc<dyn RateLimiter>,
    inputs: Arc<dyn OptimizerInputs>,
    max_read_latency: Option<f64>,
    max_write_latency: Option<f64>,
    phase: OptimizerPhase,
    initial: f64,
    step: f64,
}

impl std::fmt::Debug for RateLimiterOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterOptimizer")
            .field("phase", &self.phase)
            .field("initial", &self.initial)
            .field("step", &self.step)
            .field("rate", &self.limiter.rate())
            .finish_non_exhaustive()
    }
}

impl RateLimiterOptimizer {
    /// Captures the limiter's current rate as the target and starts in the step phase.
    ///
    /// Latency budgets are in milliseconds; `None` means unconstrained.
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        inputs: Arc<dyn OptimizerInputs>,
        max_read_latency: Option<f64>,
        max_write_latency: Option<f64>,
    ) -> Self {
        let initial = limiter.rate();
        let step = initial / 10.0;
        info!(initial, step, "stepping rate limiter towards configured rate");
        Self {
            limiter,
            inputs,
            max_read_latency,
            max_write_latency,
            phase: OptimizerPhase::Step,
            initial,
            step,
        }
    }

    /// Starts directly in the optimize phase.
    pub fn optimizing(mut self) -> Self {
        self.phase = OptimizerPhase::Optimize;
        self
    }

    pub fn phase(&self) -> OptimizerPhase {
        self.phase
    }

    pub fn initial_rate(&self) -> f64 {
        self.initial
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    /// Runs one control iteration and returns the limiter's resulting rate.
    pub fn execute(&mut self) -> f64 {
        let current = self.limiter.rate();

        if self.phase == OptimizerPhase::Step {
            let next = (current + self.step).min(self.initial);
            if next >= self.initial {
                info!("moving to optimization phase");
                self.phase = OptimizerPhase::Optimize;
            }
            self.limiter.set_rate(next);
            info!(rate = next, "stepped rate limiter");
            return next;
        }

        let total = self.inputs.total_operations();
        if total < MIN_OPERATIONS {
            debug!(total, "not enough operations to optimize");
            return current;
        }

        let Some((latency, max)) = self.current_and_max_latency() else {
            return current;
        };

        let candidate = Self::next_value(current, latency, max);
        if candidate == current {
            info!("optimizer has nothing to do");
            return current;
        }

        let throughput = self.inputs.current_total_throughput();
        if throughput < current * UTILIZATION_THRESHOLD {
            if candidate > current {
                info!(throughput, rate = current, "not increasing rate limiter, below 90% utilization");
            } else {
                info!(throughput, rate = current, "not decreasing rate limiter, limiter is not the bottleneck");
            }
            return current;
        }

        info!(from = current, to = candidate, "updating rate limiter");
        self.limiter.set_rate(candidate);
        candidate
    }

    /// Candidate rate for `latency` against budget `max` (both ms).
    pub fn next_value(current: f64, latency: f64, max: f64) -> f64 {
        let max_increase = (1.0 + max.sqrt() / 100.0).min(MAX_INCREASE_FACTOR);

        if latency > max {
            info!(latency, max, "latency over budget, reducing throughput by 10%");
            return current * BACKOFF_FACTOR;
        }
        if latency / max > HOLD_RATIO {
            info!(latency, max, "latency within 10% of budget, holding");
            return current;
        }

        let factor = (1.0 + (max - latency).cbrt() / max).min(max_increase);
        let next = current * factor;
        debug!(current, latency, max, factor, next, "raising rate limiter");
        next
    }

    /// The `(current, budget)` latency pair closest to its budget, in ms.
    ///
    /// During the populate phase (no main-path completions yet, some populate
    /// completions) populate latency is judged against the write budget; without
    /// a write budget there is nothing to judge.
    pub fn current_and_max_latency(&self) -> Option<(f64, f64)> {
        if self.max_read_latency.is_none() && self.max_write_latency.is_none() {
            return None;
        }

        let inputs = &self.inputs;
        let populating = inputs.mutation_count() == 0
            && inputs.select_count() == 0
            && inputs.deletion_count() == 0
            && inputs.populate_count() > 0;
        if populating {
            return self.max_write_latency.map(|max| {
                debug!("populate phase, judging populate latency");
                (inputs.populate_latency_ms(), max)
            });
        }

        match (self.max_read_latency, self.max_write_latency) {
            (None, Some(max_write)) => Some((inputs.write_latency_ms(), max_write)),
            (Some(max_read), None) => Some((inputs.read_latency_ms(), max_read)),
            (Some(max_read), Some(max_write)) => {
                let read = inputs.read_latency_ms();
                let write = inputs.write_latency_ms();
                if read / max_read > write / max_write {
                    Some((read, max_read))
                } else {
                    Some((write, max_write))
                }
            }
            (None, None) => None,
        }
    }

    /// Back to the step phase at the first step value.
    pub fn reset(&mut self) {
        self.phase = OptimizerPhase::Step;
        self.limiter.set_rate(self.step);
        info!(rate = self.step, "rate limiter optimizer reset");
    }
}

// ------------------------------------------------------------------------------------------------
// Scheduled task
// ------------------------------------------------------------------------------------------------

/// Timer thread calling [`RateLimiterOptimizer::execute`] at a fixed interval.
pub struct OptimizerTask {
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OptimizerTask {
    pub fn spawn(
        optimizer: Arc<Mutex<RateLimiterOptimizer>>,
        initial_delay: Duration,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("rate-optimizer".into())
            .spawn(move || {
                let mut wait = initial_delay;
                loop {
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let rate = optimizer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .execute();
                    debug!(rate, "optimizer tick");
                    wait = interval;
                }
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stops the timer and waits for an in-progress tick to finish.
    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OptimizerTask {
    fn drop(&mut self) {
        self.stop();
    }
}

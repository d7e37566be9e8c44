//! # Metrics
//!
//! Process-wide aggregation of operation counts and latencies for one run,
//! independent of any reporting sink.
//!
//! - [`Timer`]: count plus an HDR latency histogram, one per operation kind
//!   (mutations, selects, deletions, populate). DDL is counted as a mutation.
//! - [`Meter`]: a plain event counter, used for errors (failed requests and
//!   operations shed by a full request queue).
//! - [`ThroughputTracker`]: a sliding-window ops/sec estimator fed from a
//!   timer's count, one per operation kind.
//!
//! All of them are safe to update from many completion threads at once and
//! to read concurrently from the optimizer. Histograms are guarded by a
//! mutex; the critical section is a single bucket increment.
//!
//! Populate-phase traffic must not leak into main-run statistics: callers
//! invoke [`Metrics::reset_errors`] and [`Metrics::reset_throughput_trackers`]
//! at the phase boundary.

pub mod throughput;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hdrhistogram::Histogram;
use thiserror::Error;
use tracing::{debug, info};

pub use throughput::{Sample, ThroughputTracker};

use crate::operation::OperationKind;

/// Highest latency a timer can record: one hour, in nanoseconds.
const MAX_TRACKABLE_NANOS: u64 = 3_600_000_000_000;

/// Significant decimal digits kept by latency histograms.
const HISTOGRAM_SIGFIG: u8 = 3;

const NANOS_PER_MILLI: f64 = 1_000_000.0;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("window size must be greater than 1 (got {0})")]
    InvalidWindow(usize),

    #[error("sample interval must be positive")]
    InvalidInterval,

    #[error("histogram creation failed: {0}")]
    Histogram(String),

    /// `start` was called on a tracker that has been stopped.
    #[error("throughput tracker was stopped; reset it before restarting")]
    TrackerStopped,

    #[error("failed to spawn sampler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// Meter
// ------------------------------------------------------------------------------------------------

/// A resettable event counter.
#[derive(Debug, Default)]
pub struct Meter {
    count: AtomicU64,
}

impl Meter {
    pub fn mark(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}

// ------------------------------------------------------------------------------------------------
// Timer
// ------------------------------------------------------------------------------------------------

/// Point-in-time summary of a [`Timer`], latencies in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimerSnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Operation count plus a synchronized latency histogram (nanosecond resolution).
pub struct Timer {
    count: AtomicU64,
    histogram: Mutex<Histogram<u64>>,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

impl Timer {
    pub fn new() -> Result<Self, MetricsError> {
        let histogram = Histogram::new_with_bounds(1, MAX_TRACKABLE_NANOS, HISTOGRAM_SIGFIG)
            .map_err(|e| MetricsError::Histogram(e.to_string()))?;
        Ok(Self {
            count: AtomicU64::new(0),
            histogram: Mutex::new(histogram),
        })
    }

    /// Records one completed operation that took `elapsed`.
    pub fn update(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.histogram
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .saturating_record(nanos);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// 99th percentile latency in milliseconds (0 when empty).
    pub fn p99_millis(&self) -> f64 {
        let histogram = self.histogram.lock().unwrap_or_else(PoisonError::into_inner);
        histogram.value_at_quantile(0.99) as f64 / NANOS_PER_MILLI
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let histogram = self.histogram.lock().unwrap_or_else(PoisonError::into_inner);
        if histogram.is_empty() {
            return TimerSnapshot::default();
        }
        TimerSnapshot {
            count: self.count(),
            mean_ms: histogram.mean() / NANOS_PER_MILLI,
            p50_ms: histogram.value_at_quantile(0.50) as f64 / NANOS_PER_MILLI,
            p99_ms: histogram.value_at_quantile(0.99) as f64 / NANOS_PER_MILLI,
            max_ms: histogram.max() as f64 / NANOS_PER_MILLI,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Metrics
// ------------------------------------------------------------------------------------------------

/// Tuning for the throughput trackers owned by [`Metrics`].
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Number of samples retained per tracker. Default: 10. Must be > 1.
    pub window_size: usize,

    /// Period between two samples. Default: 1s. Must be non-zero.
    pub sample_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            sample_interval: Duration::from_secs(1),
        }
    }
}

/// All counters and timers of a run.
#[derive(Debug)]
pub struct Metrics {
    mutations: Arc<Timer>,
    selects: Arc<Timer>,
    deletions: Arc<Timer>,
    populate: Arc<Timer>,
    errors: Meter,

    mutation_tracker: ThroughputTracker,
    select_tracker: ThroughputTracker,
    deletion_tracker: ThroughputTracker,
    populate_tracker: ThroughputTracker,
}

impl Metrics {
    /// Creates the timers and starts one throughput tracker per operation kind.
    pub fn new(config: MetricsConfig) -> Result<Self, MetricsError> {
        let mutations = Arc::new(Timer::new()?);
        let selects = Arc::new(Timer::new()?);
        let deletions = Arc::new(Timer::new()?);
        let populate = Arc::new(Timer::new()?);

        let tracker = |timer: &Arc<Timer>| -> Result<ThroughputTracker, MetricsError> {
            let timer = Arc::clone(timer);
            let tracker = ThroughputTracker::new(
                config.window_size,
                config.sample_interval,
                move || timer.count(),
                now_millis(),
            )?;
            tracker.start()?;
            Ok(tracker)
        };

        let metrics = Self {
            mutation_tracker: tracker(&mutations)?,
            select_tracker: tracker(&selects)?,
            deletion_tracker: tracker(&deletions)?,
            populate_tracker: tracker(&populate)?,
            mutations,
            selects,
            deletions,
            populate,
            errors: Meter::default(),
        };

        info!(
            window_size = config.window_size,
            sample_interval_ms = config.sample_interval.as_millis() as u64,
            "metrics started"
        );
        Ok(metrics)
    }

    pub fn mutations(&self) -> &Arc<Timer> {
        &self.mutations
    }

    pub fn selects(&self) -> &Arc<Timer> {
        &self.selects
    }

    pub fn deletions(&self) -> &Arc<Timer> {
        &self.deletions
    }

    pub fn populate(&self) -> &Arc<Timer> {
        &self.populate
    }

    pub fn errors(&self) -> &Meter {
        &self.errors
    }

    /// The timer a completed operation of `kind` is recorded in.
    ///
    /// Everything completing during the populate phase goes to the populate
    /// timer. DDL shares the mutation timer. `Stop` has no timer.
    pub fn timer_for(&self, kind: OperationKind, populate_phase: bool) -> Option<&Arc<Timer>> {
        if populate_phase && kind != OperationKind::Stop {
            return Some(&self.populate);
        }
        match kind {
            OperationKind::Mutation | OperationKind::Ddl => Some(&self.mutations),
            OperationKind::Select => Some(&self.selects),
            OperationKind::Deletion => Some(&self.deletions),
            OperationKind::Stop => None,
        }
    }

    pub fn reset_errors(&self) {
        debug!(previous = self.errors.count(), "resetting error meter");
        self.errors.reset();
    }

    /// Restarts every throughput window at the current time.
    pub fn reset_throughput_trackers(&self) -> Result<(), MetricsError> {
        let now = now_millis();
        self.mutation_tracker.reset(now)?;
        self.select_tracker.reset(now)?;
        self.deletion_tracker.reset(now)?;
        self.populate_tracker.reset(now)?;
        debug!(start = now, "throughput trackers reset");
        Ok(())
    }

    pub fn mutation_throughput(&self) -> f64 {
        self.mutation_tracker.current_throughput()
    }

    pub fn select_throughput(&self) -> f64 {
        self.select_tracker.current_throughput()
    }

    pub fn deletion_throughput(&self) -> f64 {
        self.deletion_tracker.current_throughput()
    }

    pub fn populate_throughput(&self) -> f64 {
        self.populate_tracker.current_throughput()
    }

    /// Stops the sampler threads. Counters stay readable.
    pub fn shutdown(&self) {
        self.mutation_tracker.stop();
        self.select_tracker.stop();
        self.deletion_tracker.stop();
        self.populate_tracker.stop();
        info!(
            mutations = self.mutations.count(),
            selects = self.selects.count(),
            deletions = self.deletions.count(),
            populate = self.populate.count(),
            errors = self.errors.count(),
            "metrics shut down"
        );
    }
}

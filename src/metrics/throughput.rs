//! Sliding-window throughput estimation.
//!
//! A [`ThroughputTracker`] keeps a fixed-size circular buffer of
//! `(timestamp_ms, cumulative_count)` samples. A background sampler thread
//! appends one sample per interval; the current throughput is the count
//! delta between the oldest and newest retained samples divided by their
//! time delta.
//!
//! Slot 0 is seeded with `(start_time, count)` and the write position starts
//! at slot 1, so the first real sample already yields a rate. Until the
//! buffer has wrapped once, the oldest sample is always slot 0.
//!
//! The supplied count is cumulative, so the seed carries the count at the
//! time of the (re)start. A reset therefore measures only what happens after
//! it instead of reporting the whole history as one burst.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use super::{MetricsError, now_millis};

type CountSupplier = Box<dyn Fn() -> u64 + Send + Sync>;

/// One retained sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sample {
    pub time: u64,
    pub value: u64,
}

#[derive(Debug)]
struct Window {
    samples: Vec<Sample>,
    /// Slot the next sample is written to.
    index: usize,
    filled: bool,
}

impl Window {
    fn new(size: usize, start_time: u64, start_value: u64) -> Self {
        let mut samples = vec![Sample::default(); size];
        samples[0] = Sample {
            time: start_time,
            value: start_value,
        };
        Self {
            samples,
            index: 1,
            filled: false,
        }
    }

    /// Oldest and newest valid samples, if the window holds a positive time span.
    fn bounds(&self) -> Option<(Sample, Sample)> {
        let n = self.samples.len();
        let oldest = self.samples[if self.filled { self.index } else { 0 }];
        let newest = self.samples[(self.index + n - 1) % n];
        if oldest.time == 0 || newest.time == 0 || oldest.time >= newest.time {
            return None;
        }
        Some((oldest, newest))
    }
}

struct Shared {
    window: Mutex<Window>,
    count: CountSupplier,
}

impl Shared {
    fn record(&self, timestamp: u64) {
        let value = (self.count)();
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let index = window.index;
        window.samples[index] = Sample {
            time: timestamp,
            value,
        };
        let next = (index + 1) % window.samples.len();
        if next == 0 {
            window.filled = true;
        }
        window.index = next;
    }
}

#[derive(Default)]
struct SamplerState {
    running: Option<(Sender<()>, thread::JoinHandle<()>)>,
    stopped: bool,
}

/// Periodically sampled ops/sec estimator over a fixed window.
pub struct ThroughputTracker {
    shared: Arc<Shared>,
    interval: Duration,
    sampler: Mutex<SamplerState>,
}

impl std::fmt::Debug for ThroughputTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThroughputTracker")
            .field("interval", &self.interval)
            .field("throughput", &self.current_throughput())
            .finish_non_exhaustive()
    }
}

impl ThroughputTracker {
    /// Creates a tracker whose window starts at `start_time` (ms since epoch).
    ///
    /// Sampling does not begin until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// - [`MetricsError::InvalidWindow`] if `window_size <= 1`.
    /// - [`MetricsError::InvalidInterval`] if `sample_interval` is zero.
    pub fn new(
        window_size: usize,
        sample_interval: Duration,
        count: impl Fn() -> u64 + Send + Sync + 'static,
        start_time: u64,
    ) -> Result<Self, MetricsError> {
        if window_size <= 1 {
            return Err(MetricsError::InvalidWindow(window_size));
        }
        if sample_interval.is_zero() {
            return Err(MetricsError::InvalidInterval);
        }
        let start_value = count();
        Ok(Self {
            shared: Arc::new(Shared {
                window: Mutex::new(Window::new(window_size, start_time, start_value)),
                count: Box::new(count),
            }),
            interval: sample_interval,
            sampler: Mutex::new(SamplerState::default()),
        })
    }

    /// Starts periodic sampling. Calling it on a running tracker is a no-op.
    ///
    /// # Errors
    ///
    /// [`MetricsError::TrackerStopped`] after [`stop`](Self::stop) until the
    /// next [`reset`](Self::reset).
    pub fn start(&self) -> Result<(), MetricsError> {
        let mut state = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        if state.stopped {
            return Err(MetricsError::TrackerStopped);
        }
        if state.running.is_some() {
            return Ok(());
        }
        state.running = Some(self.spawn_sampler()?);
        Ok(())
    }

    fn spawn_sampler(&self) -> Result<(Sender<()>, thread::JoinHandle<()>), MetricsError> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("throughput-sampler".into())
            .spawn(move || {
                loop {
                    shared.record(now_millis());
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                trace!("throughput sampler exited");
            })?;
        Ok((stop_tx, handle))
    }

    /// Stops sampling. The window keeps its last samples.
    pub fn stop(&self) {
        let mut state = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        state.stopped = true;
        if let Some((stop_tx, handle)) = state.running.take() {
            drop(stop_tx);
            let _ = handle.join();
        }
    }

    /// Clears the window to a single sample at `start_time` holding the
    /// current count, so throughput counts only operations after the reset.
    ///
    /// A tracker that was sampling keeps sampling; a stopped tracker may be
    /// started again.
    pub fn reset(&self, start_time: u64) -> Result<(), MetricsError> {
        let mut state = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        let was_running = match state.running.take() {
            Some((stop_tx, handle)) => {
                drop(stop_tx);
                let _ = handle.join();
                true
            }
            None => false,
        };

        let start_value = (self.shared.count)();
        {
            let mut window = self.shared.window.lock().unwrap_or_else(PoisonError::into_inner);
            *window = Window::new(window.samples.len(), start_time, start_value);
        }

        state.stopped = false;
        if was_running {
            state.running = Some(self.spawn_sampler()?);
        }
        debug!(start_time, start_value, was_running, "throughput tracker reset");
        Ok(())
    }

    /// Takes one sample now.
    pub fn sample(&self) {
        self.shared.record(now_millis());
    }

    /// Takes one sample stamped with `timestamp` (ms since epoch).
    pub fn sample_at(&self, timestamp: u64) {
        self.shared.record(timestamp);
    }

    /// Operations per second across the retained window; 0.0 without two valid samples.
    pub fn current_throughput(&self) -> f64 {
        let window = self.shared.window.lock().unwrap_or_else(PoisonError::into_inner);
        match window.bounds() {
            Some((oldest, newest)) => {
                let elapsed = (newest.time - oldest.time).max(1);
                let delta = newest.value.saturating_sub(oldest.value);
                delta as f64 * 1000.0 / elapsed as f64
            }
            None => 0.0,
        }
    }

    /// Time span covered by the window in ms; 0 without two valid samples.
    pub fn window_size_ms(&self) -> u64 {
        let window = self.shared.window.lock().unwrap_or_else(PoisonError::into_inner);
        window
            .bounds()
            .map_or(0, |(oldest, newest)| (newest.time - oldest.time).max(1))
    }

    /// The sample stored in slot `index`.
    pub fn sample_slot(&self, index: usize) -> Option<Sample> {
        let window = self.shared.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.samples.get(index).copied()
    }
}

impl Drop for ThroughputTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

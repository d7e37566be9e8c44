//! # Request Queue
//!
//! Decouples operation generation from submission.
//!
//! Each queue owns a bounded FIFO channel and exactly one producer thread.
//! The producer walks the partition key stream and, for every key:
//!
//! 1. stops if the run's deadline has passed or the queue was stopped,
//! 2. acquires one permit from the shared rate limiter (if any),
//! 3. draws a coin in `[0, 100)` and [`classify`]s the next operation,
//! 4. asks the workload runner to build it,
//! 5. offers it to the channel **without blocking**; a full channel counts
//!    as an error and the operation is dropped.
//!
//! Production is paced by the limiter, not by completions, and every
//! operation is timestamped when built. Slow submission therefore shows up
//! as latency instead of quietly lowering the offered load.
//!
//! When generation ends the producer waits for the channel to drain, then
//! pushes a single [`Operation::Stop`]. Consumers read through
//! [`RequestQueue::operations`], which ends at the sentinel without
//! yielding it.


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::context::StressContext;
use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::operation::Operation;
use crate::partition::{PartitionKeyGenerator, PartitionKeys};
use crate::workload::WorkloadRunner;

/// Poll period while waiting for the channel to drain before pushing `Stop`.
const DRAIN_POLL: Duration = Duration::from_millis(10);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("request queue already started")]
    AlreadyStarted,

    #[error("failed to spawn producer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Classification
// ------------------------------------------------------------------------------------------------

/// What the producer asks the workload runner for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Select,
    Delete,
    Populate,
    Mutation,
}

/// Rate as a percentage, with binary float noise (`0.3 * 100 = 30.000000000000004`) rounded off.
fn percent(rate: f64) -> f64 {
    (rate * 100.0 * 1e6).round() / 1e6
}

/// Maps a coin in `[0, 100)` to an operation kind.
///
/// Thresholds are cumulative: selects take `[0, read)`, deletes
/// `[read, read + delete)`, the rest are mutations, or populate operations
/// during the populate phase. Selects are never issued while populating.
pub fn classify(coin: u32, read_rate: f64, delete_rate: f64, populate_phase: bool) -> Choice {
    let coin = f64::from(coin);
    if !populate_phase && coin < percent(read_rate) {
        Choice::Select
    } else if delete_rate > 0.0 && coin < percent(read_rate + delete_rate) {
        Choice::Delete
    } else if populate_phase {
        Choice::Populate
    } else {
        Choice::Mutation
    }
}

// ------------------------------------------------------------------------------------------------
// RequestQueue
// ------------------------------------------------------------------------------------------------

/// Parameters of one queue (one phase of one worker thread).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSettings {
    /// Upper bound on generated keys; `u64::MAX` for duration-bounded runs.
    pub total_values: u64,
    /// Wall-clock bound on generation.
    pub duration: Option<Duration>,
    pub read_rate: f64,
    pub delete_rate: f64,
    pub populate_phase: bool,
}

/// Everything the producer thread owns.
struct Producer {
    keys: PartitionKeys,
    runner: Arc<dyn WorkloadRunner>,
    limiter: Option<Arc<dyn RateLimiter>>,
    metrics: Arc<Metrics>,
    tx: Sender<Operation>,
    stop: Arc<AtomicBool>,
    settings: QueueSettings,
    thread_id: usize,
}

impl Producer {
    fn run(self) {
        let deadline = self.settings.duration.map(|d| Instant::now() + d);
        let mut rng = StdRng::from_os_rng();
        let mut produced: u64 = 0;
        let mut dropped: u64 = 0;

        for key in self.keys {
            if self.stop.load(Ordering::Acquire) {
                debug!(thread = self.thread_id, "request queue stopped");
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!(thread = self.thread_id, "run duration elapsed");
                break;
            }

            if let Some(limiter) = &self.limiter {
                limiter.acquire(1);
            }

            let coin = rng.random_range(0..100u32);
            let s = &self.settings;
            let op = match classify(coin, s.read_rate, s.delete_rate, s.populate_phase) {
                Choice::Select => self.runner.next_select(&key),
                Choice::Delete => self.runner.next_delete(&key),
                Choice::Populate => self.runner.next_populate(&key),
                Choice::Mutation => self.runner.next_mutation(&key),
            };
            if op.is_stop() {
                info!(thread = self.thread_id, "workload ended generation");
                break;
            }

            match self.tx.try_send(op) {
                Ok(()) => produced += 1,
                Err(TrySendError::Full(op)) => {
                    self.metrics.errors().mark();
                    dropped += 1;
                    trace!(thread = self.thread_id, kind = ?op.kind(), "queue full, operation dropped");
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!(thread = self.thread_id, "consumer gone, producer exiting");
                    return;
                }
            }
        }

        while !self.tx.is_empty() && !self.stop.load(Ordering::Acquire) {
            thread::sleep(DRAIN_POLL);
        }
        // The channel is empty unless the queue was stopped, in which case nobody waits for Stop.
        let _ = self.tx.try_send(Operation::Stop);

        if dropped > 0 {
            debug!(thread = self.thread_id, dropped, "operations dropped on full queue");
        }
        info!(thread = self.thread_id, produced, dropped, "request queue finished");
    }
}

/// Bounded operation queue fed by a dedicated producer thread.
pub struct RequestQueue {
    producer: Option<Producer>,
    rx: Receiver<Operation>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    thread_id: usize,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("thread_id", &self.thread_id)
            .field("queued", &self.rx.len())
            .field("started", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl RequestQueue {
    /// Builds a queue of `ctx.config.queue_depth` operations over keys in
    /// `[0, ctx.config.partition_values)`. Nothing runs until [`start`](Self::start).
    pub fn new(
        generator: &PartitionKeyGenerator,
        ctx: &StressContext,
        runner: Arc<dyn WorkloadRunner>,
        settings: QueueSettings,
    ) -> Self {
        let (tx, rx) = channel::bounded(ctx.config.queue_depth.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let producer = Producer {
            keys: generator.generate_key(settings.total_values, ctx.config.partition_values),
            runner,
            limiter: ctx.rate_limiter.clone(),
            metrics: Arc::clone(&ctx.metrics),
            tx,
            stop: Arc::clone(&stop),
            settings,
            thread_id: ctx.thread_id,
        };
        Self {
            producer: Some(producer),
            rx,
            stop,
            handle: None,
            thread_id: ctx.thread_id,
        }
    }

    /// Spawns the producer thread.
    ///
    /// # Errors
    ///
    /// [`QueueError::AlreadyStarted`] on a second call; [`QueueError::Spawn`]
    /// if the thread cannot be created.
    pub fn start(&mut self) -> Result<(), QueueError> {
        let producer = self.producer.take().ok_or(QueueError::AlreadyStarted)?;
        let settings = producer.settings;
        let handle = thread::Builder::new()
            .name(format!("request-queue-{}", self.thread_id))
            .spawn(move || producer.run())?;
        self.handle = Some(handle);

        info!(
            thread = self.thread_id,
            total_values = settings.total_values,
            duration_s = settings.duration.map(|d| d.as_secs()),
            read_rate = settings.read_rate,
            delete_rate = settings.delete_rate,
            populate = settings.populate_phase,
            "request queue started"
        );
        Ok(())
    }

    /// FIFO stream of queued operations, ending at the `Stop` sentinel.
    pub fn operations(&self) -> Operations<'_> {
        Operations {
            rx: &self.rx,
            done: false,
        }
    }

    /// Asks the producer to stop generating. Already queued operations stay readable.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Blocking iterator over a [`RequestQueue`].
#[derive(Debug)]
pub struct Operations<'a> {
    rx: &'a Receiver<Operation>,
    done: bool,
}

impl Iterator for Operations<'_> {
    type Item = Operation;

    fn next(&mut self) -> Option<Operation> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(Operation::Stop) | Err(_) => {
                self.done = true;
                None
            }
            Ok(op) => Some(op),
        }
    }
}

impl std::iter::FusedIterator for Operations<'_> {}

//! # Profile Runner
//!
//! The per-thread execution loop. A [`ProfileRunner`] owns one worker
//! thread's partition keyspace and drives its [`RequestQueue`]s:
//!
//! - [`populate`](ProfileRunner::populate) seeds data with a dedicated
//!   populate-phase queue and the populate timer;
//! - [`run`](ProfileRunner::run) executes the measured traffic.
//!
//! Operations are submitted asynchronously and never awaited one by one:
//! the loop dequeues the next operation as soon as the previous one was
//! handed to the session. Each submission carries an [`OperationCallback`]
//! that records the outcome when the session completes it.
//!
//! At the end of a phase the runner waits, up to the configured completion
//! timeout, for every in-flight operation to complete, so the next phase
//! starts from settled metrics.

pub mod callback;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use callback::{CallbackError, OperationCallback};

use crate::context::StressContext;
use crate::metrics::now_millis;
use crate::operation::Operation;
use crate::partition::{KeyGeneratorError, PartitionKeyGenerator};
use crate::queue::{QueueError, QueueSettings, RequestQueue};
use crate::workload::{WorkloadError, WorkloadProfile, WorkloadRunner};

/// Pause after a stop signal during populate, letting late completions land.
const STOP_GRACE: Duration = Duration::from_secs(1);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RunnerError {
    /// The runner was asked to stop. Graceful during populate.
    #[error("runner stopped")]
    Stopped,

    #[error("runner used before prepare()")]
    NotPrepared,

    #[error("workload error: {0}")]
    Workload(#[from] WorkloadError),

    #[error("request queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("callback error: {0}")]
    Callback(#[from] CallbackError),

    #[error("key generator error: {0}")]
    KeyGenerator(#[from] KeyGeneratorError),
}

// ------------------------------------------------------------------------------------------------
// In-flight tracking
// ------------------------------------------------------------------------------------------------

/// Count of submitted operations whose callback has not run yet.
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<u64>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn current(&self) -> u64 {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until nothing is in flight. Returns what is still pending on timeout.
    fn wait_idle(&self, timeout: Duration) -> u64 {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = self
            .idle
            .wait_timeout_while(count, timeout, |c| *c > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count
    }
}

// ------------------------------------------------------------------------------------------------
// ProfileRunner
// ------------------------------------------------------------------------------------------------

/// Drives one worker thread's traffic for one workload.
pub struct ProfileRunner {
    ctx: Arc<StressContext>,
    profile: Arc<dyn WorkloadProfile>,
    generator: PartitionKeyGenerator,
    runner: Option<Arc<dyn WorkloadRunner>>,
    paginate: AtomicBool,
    stopped: AtomicBool,
    in_flight: Arc<InFlight>,
}

impl std::fmt::Debug for ProfileRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRunner")
            .field("thread", &self.ctx.thread_id)
            .field("workload", &self.profile.name())
            .field("generator", &self.generator)
            .field("prepared", &self.runner.is_some())
            .finish_non_exhaustive()
    }
}

impl ProfileRunner {
    /// Resolves the thread's key generator from the configuration.
    ///
    /// # Errors
    ///
    /// [`RunnerError::KeyGenerator`] for an unknown generator name.
    pub fn create(ctx: StressContext, profile: Arc<dyn WorkloadProfile>) -> Result<Self, RunnerError> {
        let generator = PartitionKeyGenerator::from_name(&ctx.config.partition_key_generator, ctx.key_prefix())?;
        Ok(Self {
            paginate: AtomicBool::new(ctx.config.paginate),
            ctx: Arc::new(ctx),
            profile,
            generator,
            runner: None,
            stopped: AtomicBool::new(false),
            in_flight: Arc::new(InFlight::default()),
        })
    }

    pub fn context(&self) -> &StressContext {
        &self.ctx
    }

    pub fn generator(&self) -> &PartitionKeyGenerator {
        &self.generator
    }

    /// Prepares the workload's statements and builds this thread's workload runner.
    pub fn prepare(&mut self) -> Result<(), RunnerError> {
        self.profile.prepare(self.ctx.session.as_ref())?;
        self.runner = Some(self.profile.runner(&self.ctx)?);
        debug!(thread = self.ctx.thread_id, workload = self.profile.name(), "runner prepared");
        Ok(())
    }

    /// Executes the measured phase.
    pub fn run(&self) -> Result<(), RunnerError> {
        let config = &self.ctx.config;
        let read_rate = config.read_rate.unwrap_or_else(|| self.profile.default_read_rate());
        let delete_rate = config.delete_rate.unwrap_or(0.0);

        match config.duration {
            Some(duration) => {
                let start = now_millis();
                let end = start + u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                info!(thread = self.ctx.thread_id, start, end, "running for duration");
            }
            None => info!(
                thread = self.ctx.thread_id,
                iterations = config.effective_iterations(),
                "running iterations"
            ),
        }

        self.execute_operations(
            &self.generator,
            config.effective_iterations(),
            config.duration,
            read_rate,
            delete_rate,
            false,
        )
    }

    /// Prepopulates `rows` partitions. A stop request ends it gracefully.
    pub fn populate(&self, rows: u64, deletes: bool) -> Result<(), RunnerError> {
        let generator = self
            .profile
            .populate_key_generator(self.generator.prefix())
            .unwrap_or_else(|| self.generator.clone());
        let delete_rate = if deletes {
            self.ctx.config.delete_rate.unwrap_or(0.0)
        } else {
            0.0
        };

        info!(thread = self.ctx.thread_id, rows, deletes, generator = %generator.distribution(), "prepopulating");

        match self.execute_operations(&generator, rows, None, 0.0, delete_rate, true) {
            Ok(()) => Ok(()),
            Err(RunnerError::Stopped) => {
                info!(thread = self.ctx.thread_id, "received stop signal, ending populate");
                thread::sleep(STOP_GRACE);
                Ok(())
            }
            Err(e) => {
                error!(thread = self.ctx.thread_id, error = %e, "populate failed");
                Err(e)
            }
        }
    }

    /// Asks the current phase to stop after the operation being submitted.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.current()
    }

    fn execute_operations(
        &self,
        generator: &PartitionKeyGenerator,
        iterations: u64,
        duration: Option<Duration>,
        read_rate: f64,
        delete_rate: f64,
        populate_phase: bool,
    ) -> Result<(), RunnerError> {
        let runner = self.runner.clone().ok_or(RunnerError::NotPrepared)?;
        let total_values = if duration.is_some() { u64::MAX } else { iterations };

        let settings = QueueSettings {
            total_values,
            duration,
            read_rate,
            delete_rate,
            populate_phase,
        };
        let mut queue = RequestQueue::new(generator, &self.ctx, Arc::clone(&runner), settings);
        queue.start()?;

        let mut result = Ok(());
        for op in queue.operations() {
            if self.stopped.load(Ordering::Acquire) {
                queue.stop();
                result = Err(RunnerError::Stopped);
                break;
            }
            if let Err(e) = self.submit(&runner, op, populate_phase) {
                queue.stop();
                result = Err(e);
                break;
            }
        }
        drop(queue);

        let pending = self.in_flight.wait_idle(self.ctx.config.completion_timeout);
        if pending > 0 {
            warn!(thread = self.ctx.thread_id, pending, "operations still in flight after timeout");
        }
        result
    }

    fn submit(&self, runner: &Arc<dyn WorkloadRunner>, op: Operation, populate_phase: bool) -> Result<(), RunnerError> {
        let request = op.request().ok_or(CallbackError::UnexpectedStop)?;

        // DDL is one-shot; stop paginating for the rest of the run.
        let paginate = match op {
            Operation::Ddl { .. } => {
                self.paginate.store(false, Ordering::Relaxed);
                false
            }
            _ => self.paginate.load(Ordering::Relaxed),
        };

        let callback = OperationCallback::new(
            Arc::clone(&self.ctx),
            Arc::clone(runner),
            op,
            paginate,
            populate_phase,
            now_millis(),
            Instant::now(),
        );

        let in_flight = Arc::clone(&self.in_flight);
        let thread_id = self.ctx.thread_id;
        in_flight.begin();
        self.ctx.session.execute_async(
            request,
            Box::new(move |result| {
                if let Err(e) = callback.complete(result) {
                    error!(thread = thread_id, error = %e, "operation callback failed");
                }
                in_flight.end();
            }),
        );
        Ok(())
    }
}

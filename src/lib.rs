//! # Aeternus Stress
//!
//! A traffic-generation and rate-adaptation engine for load testing a
//! partitioned database. Worker threads generate partition keys, turn them
//! into operations under a shared, self-tuning rate limit, submit them
//! asynchronously and record end-to-end latency per operation kind.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use aeternus_stress::session::memory::{MemorySession, MemorySessionConfig};
//! use aeternus_stress::workload::WorkloadRegistry;
//! use aeternus_stress::{Stress, StressConfig};
//!
//! let session = Arc::new(MemorySession::open(MemorySessionConfig::default()).unwrap());
//! let config = StressConfig {
//!     threads: 2,
//!     duration: Some(Duration::from_secs(10)),
//!     rate: Some(5_000.0),
//!     max_write_latency: Some(20.0),
//!     ..StressConfig::default()
//! };
//!
//! let stress = Stress::from_registry(config, session, &WorkloadRegistry::builtin(), "KeyValue").unwrap();
//! let summary = stress.run().unwrap();
//! println!("p99 writes: {:.2} ms", summary.mutations.p99_ms);
//! ```
//!
//! ## Features
//!
//! - **Coordinated-omission avoidance**: operations are paced and timestamped
//!   at production time, so queueing delay shows up as latency.
//! - **Load shedding**: a full request queue drops the operation and counts an error.
//! - **Adaptive rate**: a step-then-optimize controller tunes the shared rate
//!   limiter against p99 latency budgets.
//! - **Pluggable workloads**: profiles are registered by name and tuned
//!   through typed parameters.

pub mod collector;
pub mod context;
pub mod limiter;
pub mod metrics;
pub mod operation;
pub mod optimizer;
pub mod partition;
pub mod queue;
pub mod runner;
pub mod session;
pub mod workload;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use collector::{Collector, NoopCollector};
use context::StressContext;
use limiter::{LimiterError, RateLimiter, TokenBucket};
use metrics::{Metrics, MetricsConfig, MetricsError, TimerSnapshot};
use optimizer::{OptimizerInputs, OptimizerTask, RateLimiterOptimizer};
use partition::{KeyGeneratorError, PartitionKeyGenerator};
use runner::{ProfileRunner, RunnerError};
use session::{Session, SessionError};
use workload::{
    Field, FieldGenerator, FieldRegistry, PopulateOption, WorkloadError, WorkloadProfile, WorkloadRegistry,
};

/// Iterations per thread when neither a count nor a duration is configured.
pub const DEFAULT_ITERATIONS: u64 = 1_000_000;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration of a stress run.
///
/// All fields have defaults via [`StressConfig::default()`]. The
/// configuration is validated when passed to [`Stress::new`], before any
/// schema statement or worker thread runs.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use aeternus_stress::StressConfig;
///
/// let config = StressConfig {
///     threads: 8,
///     partition_values: 1_000_000,
///     duration: Some(Duration::from_secs(60)),
///     rate: Some(20_000.0),
///     ..StressConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Run identifier, part of every partition key prefix.
    ///
    /// Default: `"001"`.
    pub id: String,

    /// Number of distinct partition ids per thread.
    ///
    /// Default: 10 000. Must be ≥ 1.
    pub partition_values: u64,

    /// Fraction of selects. `None` uses the workload's default.
    pub read_rate: Option<f64>,

    /// Fraction of deletes. `None` means no deletes.
    pub delete_rate: Option<f64>,

    /// Rows each thread writes before the measured phase.
    ///
    /// Default: 0. Workloads with a custom populate option ignore it.
    pub populate: u64,

    /// Number of worker threads.
    ///
    /// Default: 1. Must be ≥ 1.
    pub threads: usize,

    /// Operations per thread. Mutually exclusive with `duration`.
    ///
    /// Default: `None`, which means [`DEFAULT_ITERATIONS`] unless a duration is set.
    pub iterations: Option<u64>,

    /// Length of the measured phase. Mutually exclusive with `iterations`.
    pub duration: Option<Duration>,

    /// Shared operations/sec cap across all threads. `None` disables rate
    /// limiting and the optimizer.
    pub rate: Option<f64>,

    /// p99 read latency budget in milliseconds.
    pub max_read_latency: Option<f64>,

    /// p99 write latency budget in milliseconds.
    pub max_write_latency: Option<f64>,

    /// Capacity of each thread's request queue.
    ///
    /// Default: 4096. Must be ≥ 1.
    pub queue_depth: usize,

    /// `sequence`, `random` or `normal`.
    ///
    /// Default: `random`.
    pub partition_key_generator: String,

    /// Fetch every page of multi-page results.
    ///
    /// Default: false.
    pub paginate: bool,

    /// Skip schema and additional statements.
    ///
    /// Default: false.
    pub no_schema: bool,

    /// Statements executed after the workload schema.
    pub additional_statements: Vec<String>,

    /// Workload tunables, applied by name before the run.
    pub workload_parameters: BTreeMap<String, String>,

    /// Samples per throughput window.
    ///
    /// Default: 10. Must be > 1.
    pub throughput_window: usize,

    /// Period between throughput samples.
    ///
    /// Default: 1s.
    pub throughput_sample_interval: Duration,

    /// Delay before the first optimizer tick.
    ///
    /// Default: 5s.
    pub optimizer_initial_delay: Duration,

    /// Period between optimizer ticks.
    ///
    /// Default: 10s.
    pub optimizer_interval: Duration,

    /// Upper bound on waiting for in-flight operations at the end of a phase.
    ///
    /// Default: 30s.
    pub completion_timeout: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            id: "001".to_string(),
            partition_values: 10_000,
            read_rate: None,
            delete_rate: None,
            populate: 0,
            threads: 1,
            iterations: None,
            duration: None,
            rate: None,
            max_read_latency: None,
            max_write_latency: None,
            queue_depth: 4096,
            partition_key_generator: "random".to_string(),
            paginate: false,
            no_schema: false,
            additional_statements: Vec::new(),
            workload_parameters: BTreeMap::new(),
            throughput_window: 10,
            throughput_sample_interval: Duration::from_secs(1),
            optimizer_initial_delay: Duration::from_secs(5),
            optimizer_interval: Duration::from_secs(10),
            completion_timeout: Duration::from_secs(30),
        }
    }
}

fn is_fraction(rate: Option<f64>) -> bool {
    rate.is_none_or(|r| (0.0..=1.0).contains(&r))
}

fn is_positive(value: Option<f64>) -> bool {
    value.is_none_or(|v| v.is_finite() && v > 0.0)
}

impl StressConfig {
    /// Operations per thread in the measured phase of an iteration-bounded run.
    pub fn effective_iterations(&self) -> u64 {
        self.iterations.unwrap_or(DEFAULT_ITERATIONS)
    }

    fn validate(&self) -> Result<(), StressError> {
        let invalid = |msg: &str| -> Result<(), StressError> { Err(StressError::InvalidConfig(msg.into())) };

        if self.duration.is_some() && self.iterations.is_some() {
            return invalid("duration and iterations are mutually exclusive");
        }
        if self.duration.is_some_and(|d| d.is_zero()) {
            return invalid("duration must be > 0");
        }
        if self.threads < 1 {
            return invalid("threads must be >= 1");
        }
        if self.queue_depth < 1 {
            return invalid("queue_depth must be >= 1");
        }
        if self.partition_values < 1 {
            return invalid("partition_values must be >= 1");
        }
        if !is_positive(self.rate) {
            return invalid("rate must be > 0");
        }
        if !is_fraction(self.read_rate) {
            return invalid("read_rate must be in [0.0, 1.0]");
        }
        if !is_fraction(self.delete_rate) {
            return invalid("delete_rate must be in [0.0, 1.0]");
        }
        if !is_positive(self.max_read_latency) || !is_positive(self.max_write_latency) {
            return invalid("latency thresholds must be > 0");
        }
        if self.throughput_window < 2 {
            return invalid("throughput_window must be >= 2");
        }
        if self.throughput_sample_interval.is_zero() || self.optimizer_interval.is_zero() {
            return invalid("sample and optimizer intervals must be > 0");
        }
        PartitionKeyGenerator::from_name(&self.partition_key_generator, "")?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Stress`].
#[derive(Debug, Error)]
pub enum StressError {
    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    KeyGenerator(#[from] KeyGeneratorError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Limiter(#[from] LimiterError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Workload(#[from] WorkloadError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// A worker thread panicked.
    #[error("worker thread {0} panicked")]
    WorkerPanicked(usize),
}

// ------------------------------------------------------------------------------------------------
// Summary
// ------------------------------------------------------------------------------------------------

/// Final counters of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub mutations: TimerSnapshot,
    pub selects: TimerSnapshot,
    pub deletions: TimerSnapshot,
    pub populate: TimerSnapshot,
    /// Errors of the measured phase. Populate errors are reset at the phase boundary.
    pub errors: u64,
    /// Limiter rate when the run ended.
    pub final_rate: Option<f64>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn total_operations(&self) -> u64 {
        self.mutations.count + self.selects.count + self.deletions.count
    }
}

// ------------------------------------------------------------------------------------------------
// Stress
// ------------------------------------------------------------------------------------------------

/// Orchestrates one run: schema, populate phase, measured phase.
///
/// # Lifecycle
///
/// 1. Schema and additional statements (unless `no_schema`).
/// 2. Statement preparation and one [`ProfileRunner`] per thread.
/// 3. Populate phase on every thread, if the workload asks for rows.
/// 4. Errors, throughput windows and the optimizer are reset.
/// 5. Measured phase on every thread.
/// 6. Optimizer stopped, collectors closed, metrics shut down.
pub struct Stress {
    config: Arc<StressConfig>,
    session: Arc<dyn Session>,
    profile: Arc<dyn WorkloadProfile>,
    collector: Arc<dyn Collector>,
    field_overrides: Vec<(Field, Arc<dyn FieldGenerator>)>,
}

impl std::fmt::Debug for Stress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stress")
            .field("workload", &self.profile.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Stress {
    /// Validates the configuration against `profile`.
    ///
    /// # Errors
    ///
    /// [`StressError::InvalidConfig`] if a parameter is out of range or the
    /// read and delete rates add up to more than 1, and
    /// [`StressError::KeyGenerator`] for an unknown generator name.
    pub fn new(
        config: StressConfig,
        session: Arc<dyn Session>,
        profile: Box<dyn WorkloadProfile>,
    ) -> Result<Self, StressError> {
        config.validate()?;

        let read = config.read_rate.unwrap_or_else(|| profile.default_read_rate());
        let delete = config.delete_rate.unwrap_or(0.0);
        if read + delete > 1.0 {
            return Err(StressError::InvalidConfig(format!(
                "read_rate ({read}) + delete_rate ({delete}) must be <= 1.0"
            )));
        }

        Ok(Self {
            config: Arc::new(config),
            session,
            profile: Arc::from(profile),
            collector: Arc::new(NoopCollector),
            field_overrides: Vec::new(),
        })
    }

    /// Resolves `workload` in `registry` and applies `config.workload_parameters`.
    ///
    /// # Errors
    ///
    /// [`StressError::Workload`] for an unknown workload or a bad parameter,
    /// plus everything [`Stress::new`] returns.
    pub fn from_registry(
        config: StressConfig,
        session: Arc<dyn Session>,
        registry: &WorkloadRegistry,
        workload: &str,
    ) -> Result<Self, StressError> {
        let profile = registry.create_with(workload, &config.workload_parameters)?;
        Self::new(config, session, profile)
    }

    pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collector = collector;
        self
    }

    /// Replaces the workload's generator for one field.
    pub fn with_field_override(mut self, field: Field, generator: Arc<dyn FieldGenerator>) -> Self {
        self.field_overrides.push((field, generator));
        self
    }

    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    /// Runs both phases to completion.
    pub fn run(self) -> Result<RunSummary, StressError> {
        let started = Instant::now();
        let config = &self.config;
        info!(workload = self.profile.name(), threads = config.threads, id = %config.id, "starting stress run");

        self.setup_schema()?;
        self.profile.prepare(self.session.as_ref())?;

        let metrics = Arc::new(Metrics::new(MetricsConfig {
            window_size: config.throughput_window,
            sample_interval: config.throughput_sample_interval,
        })?);

        let limiter: Option<Arc<dyn RateLimiter>> = match config.rate {
            Some(rate) => Some(Arc::new(TokenBucket::new(rate)?)),
            None => None,
        };

        let mut fields = FieldRegistry::with_defaults(self.profile.field_generators());
        for (field, generator) in &self.field_overrides {
            fields.set_override(field.clone(), Arc::clone(generator));
        }

        let base = StressContext {
            session: Arc::clone(&self.session),
            config: Arc::clone(config),
            thread_id: 0,
            metrics: Arc::clone(&metrics),
            fields: Arc::new(fields),
            rate_limiter: limiter.clone(),
            collector: Arc::clone(&self.collector),
        };

        let optimizer = limiter.as_ref().map(|limiter| {
            let inputs: Arc<dyn OptimizerInputs> = metrics.clone();
            let mut optimizer = RateLimiterOptimizer::new(
                Arc::clone(limiter),
                inputs,
                config.max_read_latency,
                config.max_write_latency,
            );
            optimizer.reset();
            Arc::new(Mutex::new(optimizer))
        });
        let mut task = match &optimizer {
            Some(optimizer) => Some(OptimizerTask::spawn(
                Arc::clone(optimizer),
                config.optimizer_initial_delay,
                config.optimizer_interval,
            )?),
            None => None,
        };

        // Teardown runs even when a phase fails.
        let result = self.run_phases(&base, &metrics, optimizer.as_ref());

        if let Some(task) = task.as_mut() {
            task.stop();
        }
        self.collector.close(&base);
        metrics.shutdown();
        result?;

        let summary = RunSummary {
            mutations: metrics.mutations().snapshot(),
            selects: metrics.selects().snapshot(),
            deletions: metrics.deletions().snapshot(),
            populate: metrics.populate().snapshot(),
            errors: metrics.errors().count(),
            final_rate: limiter.as_ref().map(|l| l.rate()),
            elapsed: started.elapsed(),
        };
        info!(
            operations = summary.total_operations(),
            errors = summary.errors,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "stress run finished"
        );
        Ok(summary)
    }

    /// Creates the per-thread runners, then runs populate and the main phase.
    fn run_phases(
        &self,
        base: &StressContext,
        metrics: &Metrics,
        optimizer: Option<&Arc<Mutex<RateLimiterOptimizer>>>,
    ) -> Result<(), StressError> {
        let config = &self.config;
        let mut runners = Vec::with_capacity(config.threads);
        for thread_id in 0..config.threads {
            let mut runner = ProfileRunner::create(base.for_thread(thread_id), Arc::clone(&self.profile))?;
            runner.prepare()?;
            runners.push(runner);
        }

        let (rows, deletes) = match self.profile.populate_option(config) {
            PopulateOption::Standard => (config.populate, true),
            PopulateOption::Custom { rows, deletes } => (rows, deletes),
        };
        if rows > 0 {
            info!(rows, deletes, "populate phase");
            run_phase(&runners, "populate", |runner| runner.populate(rows, deletes))?;
        }

        metrics.reset_errors();
        metrics.reset_throughput_trackers()?;
        if let Some(optimizer) = optimizer {
            optimizer.lock().unwrap_or_else(PoisonError::into_inner).reset();
        }

        info!("main phase");
        run_phase(&runners, "run", ProfileRunner::run)
    }

    fn setup_schema(&self) -> Result<(), StressError> {
        if self.config.no_schema {
            debug!("schema setup skipped");
            return Ok(());
        }
        let statements = self.profile.schema().into_iter().chain(self.config.additional_statements.iter().cloned());
        for statement in statements {
            debug!(%statement, "executing schema statement");
            self.session.execute(&statement)?;
        }
        Ok(())
    }
}

/// Runs `phase` on every runner in its own thread and returns the first failure.
fn run_phase<F>(runners: &[ProfileRunner], name: &str, phase: F) -> Result<(), StressError>
where
    F: Fn(&ProfileRunner) -> Result<(), RunnerError> + Sync,
{
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(runners.len());
        for (id, runner) in runners.iter().enumerate() {
            let phase = &phase;
            let handle = thread::Builder::new()
                .name(format!("stress-{name}-{id}"))
                .spawn_scoped(scope, move || phase(runner))?;
            handles.push(handle);
        }

        let mut first = Ok(());
        for (id, handle) in handles.into_iter().enumerate() {
            let outcome = match handle.join() {
                Ok(result) => result.map_err(StressError::from),
                Err(_) => Err(StressError::WorkerPanicked(id)),
            };
            if let Err(e) = outcome {
                warn!(thread = id, phase = name, error = %e, "worker failed");
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    })
}

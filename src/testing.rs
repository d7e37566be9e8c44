//! Shared fixtures for unit tests: tracing, contexts over the memory
//! session, a scripted workload runner and a recording collector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::StressConfig;
use crate::collector::{Collector, Outcome};
use crate::context::StressContext;
use crate::limiter::RateLimiter;
use crate::metrics::{Metrics, MetricsConfig};
use crate::operation::{Operation, OperationKind};
use crate::partition::PartitionKey;
use crate::session::memory::{MemorySession, MemorySessionConfig};
use crate::session::{PreparedStatement, ResultSet, Session};
use crate::workload::{FieldRegistry, PopulateOption, WorkloadError, WorkloadProfile, WorkloadRunner};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small, fast configuration: 100 partitions, 1 000 iterations, short timers.
pub fn test_config() -> StressConfig {
    StressConfig {
        partition_values: 100,
        iterations: Some(1_000),
        queue_depth: 1_024,
        throughput_window: 4,
        throughput_sample_interval: Duration::from_millis(50),
        completion_timeout: Duration::from_secs(5),
        ..StressConfig::default()
    }
}

pub fn memory_session(config: MemorySessionConfig) -> Arc<MemorySession> {
    Arc::new(MemorySession::open(config).unwrap())
}

pub struct ContextBuilder {
    session: Arc<MemorySession>,
    config: StressConfig,
    limiter: Option<Arc<dyn RateLimiter>>,
    collector: Arc<dyn Collector>,
    fields: FieldRegistry,
}

impl ContextBuilder {
    pub fn new(session: Arc<MemorySession>) -> Self {
        init_tracing();
        Self {
            session,
            config: test_config(),
            limiter: None,
            collector: Arc::new(RecordingCollector::default()),
            fields: FieldRegistry::new(),
        }
    }

    pub fn config(mut self, config: StressConfig) -> Self {
        self.config = config;
        self
    }

    pub fn limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collector = collector;
        self
    }

    pub fn fields(mut self, fields: FieldRegistry) -> Self {
        self.fields = fields;
        self
    }

    pub fn build(self) -> StressContext {
        let metrics = Metrics::new(MetricsConfig {
            window_size: self.config.throughput_window,
            sample_interval: self.config.throughput_sample_interval,
        })
        .unwrap();
        StressContext {
            session: self.session,
            config: Arc::new(self.config),
            thread_id: 0,
            metrics: Arc::new(metrics),
            fields: Arc::new(self.fields),
            rate_limiter: self.limiter,
            collector: self.collector,
        }
    }
}

/// Context over a default memory session with [`test_config`].
pub fn context() -> (Arc<MemorySession>, StressContext) {
    let session = memory_session(MemorySessionConfig::default());
    let ctx = ContextBuilder::new(Arc::clone(&session)).build();
    (session, ctx)
}

// ------------------------------------------------------------------------------------------------
// Scripted workload runner
// ------------------------------------------------------------------------------------------------

/// Key/value runner over table `kv` that counts every call and can end
/// generation after a fixed number of operations.
pub struct ScriptedRunner {
    insert: PreparedStatement,
    select: PreparedStatement,
    delete: PreparedStatement,
    stop_after: Option<u64>,
    pub generated: AtomicU64,
    pub mutations: AtomicU64,
    pub selects: AtomicU64,
    pub deletes: AtomicU64,
    pub populates: AtomicU64,
    pub successes: AtomicU64,
    pub keys: Mutex<Vec<PartitionKey>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self {
            insert: PreparedStatement::new("INSERT INTO kv (k, v) VALUES (?, ?)"),
            select: PreparedStatement::new("SELECT * FROM kv WHERE k = ?"),
            delete: PreparedStatement::new("DELETE FROM kv WHERE k = ?"),
            stop_after: None,
            generated: AtomicU64::new(0),
            mutations: AtomicU64::new(0),
            selects: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            populates: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            keys: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedRunner {
    pub fn stopping_after(n: u64) -> Self {
        Self {
            stop_after: Some(n),
            ..Self::default()
        }
    }

    pub fn count(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }

    /// Records the call; `false` once the script is exhausted.
    fn tick(&self, key: &PartitionKey, counter: &AtomicU64) -> bool {
        let n = self.generated.fetch_add(1, Ordering::SeqCst);
        if self.stop_after.is_some_and(|limit| n >= limit) {
            return false;
        }
        counter.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(key.clone());
        true
    }
}

impl WorkloadRunner for ScriptedRunner {
    fn next_mutation(&self, key: &PartitionKey) -> Operation {
        if !self.tick(key, &self.mutations) {
            return Operation::Stop;
        }
        let text = key.text();
        Operation::mutation(self.insert.bind(vec![text.clone().into(), "v".into()]).with_routing_key(text))
    }

    fn next_select(&self, key: &PartitionKey) -> Operation {
        if !self.tick(key, &self.selects) {
            return Operation::Stop;
        }
        let text = key.text();
        Operation::select(self.select.bind(vec![text.clone().into()]).with_routing_key(text))
    }

    fn next_delete(&self, key: &PartitionKey) -> Operation {
        if !self.tick(key, &self.deletes) {
            return Operation::Stop;
        }
        let text = key.text();
        Operation::deletion(self.delete.bind(vec![text.clone().into()]).with_routing_key(text))
    }

    fn next_populate(&self, key: &PartitionKey) -> Operation {
        if !self.tick(key, &self.populates) {
            return Operation::Stop;
        }
        let text = key.text();
        Operation::mutation(self.insert.bind(vec![text.clone().into(), "p".into()]).with_routing_key(text))
    }

    fn on_success(&self, _op: &Operation, _result: &dyn ResultSet) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Profile handing every thread the same [`ScriptedRunner`].
pub struct ScriptedProfile {
    pub runner: Arc<ScriptedRunner>,
    pub read_rate: f64,
    pub populate: PopulateOption,
}

impl ScriptedProfile {
    pub fn new(runner: Arc<ScriptedRunner>) -> Self {
        Self {
            runner,
            read_rate: 0.0,
            populate: PopulateOption::Standard,
        }
    }
}

impl WorkloadProfile for ScriptedProfile {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    fn schema(&self) -> Vec<String> {
        vec!["CREATE TABLE IF NOT EXISTS kv (k text PRIMARY KEY, v text)".to_string()]
    }

    fn prepare(&self, _session: &dyn Session) -> Result<(), WorkloadError> {
        Ok(())
    }

    fn default_read_rate(&self) -> f64 {
        self.read_rate
    }

    fn runner(&self, _ctx: &StressContext) -> Result<Arc<dyn WorkloadRunner>, WorkloadError> {
        Ok(self.runner.clone())
    }

    fn populate_option(&self, _config: &crate::StressConfig) -> PopulateOption {
        self.populate
    }
}

// ------------------------------------------------------------------------------------------------
// Recording collector
// ------------------------------------------------------------------------------------------------

/// One collected event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: OperationKind,
    pub ok: bool,
    pub start_millis: u64,
    pub duration: Duration,
}

#[derive(Default)]
pub struct RecordingCollector {
    pub events: Mutex<Vec<Event>>,
    pub closed: AtomicU64,
}

impl RecordingCollector {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn failures(&self) -> usize {
        self.events().iter().filter(|e| !e.ok).count()
    }
}

impl Collector for RecordingCollector {
    fn collect(&self, _ctx: &StressContext, op: &Operation, outcome: Outcome<'_>, start_millis: u64, duration: Duration) {
        self.events.lock().unwrap().push(Event {
            kind: op.kind(),
            ok: outcome.is_ok(),
            start_millis,
            duration,
        });
    }

    fn close(&self, _ctx: &StressContext) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

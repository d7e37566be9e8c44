//! Integration tests for the public `Stress` API.
//!
//! These tests drive complete runs (schema → populate → measured phase)
//! through `aeternus_stress::{Stress, StressConfig, StressError}` against
//! the in-memory session. No crate-private items are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: schema setup, populate, measured phase, summary totals
//! - **Workloads**: KeyValue, Locking (custom populate), CreateDrop (DDL churn)
//! - **Config validation**: every `StressConfig` constraint violation rejected
//! - **Failures**: injected request failures are counted, never fatal
//! - **Rate control**: limiter caps traffic, optimizer ramps the rate
//! - **Reporting**: collectors see every completion and are closed once
//! - **Concurrency**: many worker threads over disjoint keyspaces

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use aeternus_stress::collector::{Collector, Outcome};
use aeternus_stress::context::StressContext;
use aeternus_stress::operation::Operation;
use aeternus_stress::session::memory::{MemorySession, MemorySessionConfig};
use aeternus_stress::session::{Completion, PreparedStatement, Request, ResultSet, Session, SessionError, StatementKind};
use aeternus_stress::workload::{Field, FieldGenerator, WorkloadError, WorkloadRegistry};
use aeternus_stress::{Stress, StressConfig, StressError};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn session(config: MemorySessionConfig) -> Arc<MemorySession> {
    Arc::new(MemorySession::open(config).unwrap())
}

/// Small keyspace, short timers, iteration-bounded.
fn quick_config(iterations: u64) -> StressConfig {
    StressConfig {
        partition_values: 100,
        iterations: Some(iterations),
        throughput_window: 4,
        throughput_sample_interval: Duration::from_millis(50),
        completion_timeout: Duration::from_secs(10),
        ..StressConfig::default()
    }
}

fn stress(config: StressConfig, session: &Arc<MemorySession>, workload: &str) -> Result<Stress, StressError> {
    Stress::from_registry(config, session.clone(), &WorkloadRegistry::builtin(), workload)
}

#[derive(Default)]
struct Counting {
    ok: AtomicU64,
    failed: AtomicU64,
    closed: AtomicU64,
}

impl Collector for Counting {
    fn collect(&self, _: &StressContext, _: &Operation, outcome: Outcome<'_>, _: u64, _: Duration) {
        match outcome {
            Ok(_) => self.ok.fetch_add(1, Ordering::SeqCst),
            Err(_) => self.failed.fetch_add(1, Ordering::SeqCst),
        };
    }

    fn close(&self, _: &StressContext) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Delegates to a memory session but panics on the first insert.
struct PanicOnInsert(Arc<MemorySession>);

impl Session for PanicOnInsert {
    fn prepare(&self, query: &str) -> Result<PreparedStatement, SessionError> {
        self.0.prepare(query)
    }

    fn execute(&self, query: &str) -> Result<Box<dyn ResultSet>, SessionError> {
        self.0.execute(query)
    }

    fn execute_async(&self, request: Request, on_complete: Completion) {
        assert_ne!(request.kind(), StatementKind::Insert, "insert submitted");
        self.0.execute_async(request, on_complete);
    }
}

struct Fixed(&'static str);

impl FieldGenerator for Fixed {
    fn text(&self) -> String {
        self.0.to_string()
    }
}

// ================================================================================================
// Lifecycle
// ================================================================================================

/// # Scenario
/// A plain KeyValue run completes every iteration.
///
/// # Starting environment
/// Fresh memory session, one thread, 500 iterations, default read rate.
///
/// # Actions
/// 1. `Stress::from_registry(.., "KeyValue")`.
/// 2. `stress.run()`.
///
/// # Expected behavior
/// The schema table exists, 500 operations completed without errors and
/// the populate timer is untouched.
#[test]
fn key_value_run_completes() {
    let session = session(MemorySessionConfig::default());
    let summary = stress(quick_config(500), &session, "KeyValue").unwrap().run().unwrap();

    assert!(session.table_exists("keyvalue"));
    assert_eq!(summary.total_operations(), 500);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.populate.count, 0);
    assert!(summary.mutations.count > 0 && summary.selects.count > 0);
    assert!(summary.final_rate.is_none());
}

/// # Scenario
/// Standard populate runs before the measured phase on every thread.
///
/// # Starting environment
/// Two threads, `populate = 50`, read rate forced to zero.
///
/// # Actions
/// 1. Run KeyValue.
///
/// # Expected behavior
/// 100 populate writes are recorded separately from the 2 × 20 measured writes.
#[test]
fn populate_precedes_measured_phase() {
    let session = session(MemorySessionConfig::default());
    let config = StressConfig {
        threads: 2,
        populate: 50,
        read_rate: Some(0.0),
        ..quick_config(20)
    };
    let summary = stress(config, &session, "KeyValue").unwrap().run().unwrap();

    assert_eq!(summary.populate.count, 100);
    assert_eq!(summary.mutations.count, 40);
    assert_eq!(session.stats().inserts, 140);
}

/// # Scenario
/// Locking populates each partition exactly once with its own generator.
///
/// # Starting environment
/// Two threads, 20 partitions each, `populate` left at zero.
///
/// # Actions
/// 1. Run Locking for 10 iterations per thread.
///
/// # Expected behavior
/// Every one of the 40 keys is inserted during populate, whatever
/// `config.populate` says.
#[test]
fn locking_populates_every_partition() {
    let session = session(MemorySessionConfig::default());
    let config = StressConfig {
        threads: 2,
        partition_values: 20,
        read_rate: Some(0.0),
        ..quick_config(10)
    };
    let summary = stress(config, &session, "Locking").unwrap().run().unwrap();

    assert_eq!(summary.populate.count, 40);
    assert_eq!(session.row_count("lwtupdates"), 40);
    assert_eq!(summary.mutations.count, 20);
    assert_eq!(session.stats().updates, 20);
}

/// # Scenario
/// CreateDrop churns tables while writing.
///
/// # Starting environment
/// `ddl_every = 10`, `active_tables = 3`, 200 iterations.
///
/// # Actions
/// 1. Run CreateDrop with workload parameters from the config.
///
/// # Expected behavior
/// Schema statements beyond the first table were executed and the run
/// finished without errors.
#[test]
fn create_drop_churns_tables() {
    let session = session(MemorySessionConfig::default());
    let mut config = quick_config(200);
    config.workload_parameters.insert("ddl_every".into(), "10".into());
    config.workload_parameters.insert("active_tables".into(), "3".into());

    let summary = stress(config, &session, "CreateDrop").unwrap().run().unwrap();

    assert_eq!(summary.errors, 0);
    // One synchronous CREATE plus one DDL every 10 mutations.
    assert!(session.stats().schema >= 3, "schema statements: {}", session.stats().schema);
}

/// # Scenario
/// Additional statements run after the schema; `no_schema` skips both.
///
/// # Starting environment
/// Two fresh sessions.
///
/// # Actions
/// 1. Run with an extra CREATE statement.
/// 2. Run again with `no_schema = true`.
///
/// # Expected behavior
/// Only the first session has the extra table and executed schema statements.
#[test]
fn additional_statements_and_no_schema() {
    let extra = "CREATE TABLE IF NOT EXISTS audit (k text PRIMARY KEY)".to_string();

    let with_schema = session(MemorySessionConfig::default());
    let config = StressConfig {
        additional_statements: vec![extra.clone()],
        ..quick_config(10)
    };
    stress(config, &with_schema, "KeyValue").unwrap().run().unwrap();
    assert!(with_schema.table_exists("audit"));
    assert_eq!(with_schema.stats().schema, 2);

    let without = session(MemorySessionConfig::default());
    let config = StressConfig {
        no_schema: true,
        additional_statements: vec![extra],
        ..quick_config(10)
    };
    stress(config, &without, "KeyValue").unwrap().run().unwrap();
    assert!(!without.table_exists("audit"));
    assert_eq!(without.stats().schema, 0);
}

/// # Scenario
/// A field override replaces the workload's generator.
///
/// # Starting environment
/// One partition, sequence keys, writes only.
///
/// # Actions
/// 1. Override `keyvalue.value` with a constant generator and run.
///
/// # Expected behavior
/// The stored row carries the constant.
#[test]
fn field_override_is_used() {
    let session = session(MemorySessionConfig::default());
    let config = StressConfig {
        partition_values: 1,
        partition_key_generator: "sequence".into(),
        read_rate: Some(0.0),
        ..quick_config(5)
    };
    stress(config, &session, "KeyValue")
        .unwrap()
        .with_field_override(Field::new("keyvalue", "value"), Arc::new(Fixed("constant")))
        .run()
        .unwrap();

    let row = session.get("keyvalue", "001.0.0").unwrap();
    assert_eq!(row[1].as_text(), Some("constant"));
}

// ================================================================================================
// Config validation
// ================================================================================================

/// # Scenario
/// Every invalid configuration is rejected before any statement runs.
///
/// # Starting environment
/// Fresh memory session.
///
/// # Actions
/// 1. Build a `Stress` for each invalid config.
///
/// # Expected behavior
/// Each returns `InvalidConfig` (or `KeyGenerator` for an unknown generator)
/// and the session executed nothing.
#[test]
fn invalid_configs_rejected() {
    let session = session(MemorySessionConfig::default());
    let invalid = [
        StressConfig {
            duration: Some(Duration::from_secs(1)),
            ..quick_config(10)
        },
        StressConfig {
            threads: 0,
            ..quick_config(10)
        },
        StressConfig {
            queue_depth: 0,
            ..quick_config(10)
        },
        StressConfig {
            partition_values: 0,
            ..quick_config(10)
        },
        StressConfig {
            rate: Some(0.0),
            ..quick_config(10)
        },
        StressConfig {
            read_rate: Some(1.5),
            ..quick_config(10)
        },
        StressConfig {
            delete_rate: Some(-0.1),
            ..quick_config(10)
        },
        StressConfig {
            max_read_latency: Some(0.0),
            ..quick_config(10)
        },
        StressConfig {
            throughput_window: 1,
            ..quick_config(10)
        },
        StressConfig {
            read_rate: Some(0.7),
            delete_rate: Some(0.5),
            ..quick_config(10)
        },
        // KeyValue reads half of the time by default.
        StressConfig {
            delete_rate: Some(0.6),
            ..quick_config(10)
        },
    ];

    for config in invalid {
        let result = stress(config.clone(), &session, "KeyValue");
        assert!(
            matches!(result, Err(StressError::InvalidConfig(_))),
            "accepted {config:?}"
        );
    }

    let config = StressConfig {
        partition_key_generator: "zipf".into(),
        ..quick_config(10)
    };
    assert!(matches!(stress(config, &session, "KeyValue"), Err(StressError::KeyGenerator(_))));
    assert_eq!(session.stats().schema, 0);
}

/// # Scenario
/// Unknown workloads and bad parameters fail fast.
///
/// # Starting environment
/// Fresh memory session.
///
/// # Actions
/// 1. Ask for an unknown workload.
/// 2. Pass a non-numeric `ddl_every` to CreateDrop.
///
/// # Expected behavior
/// Both return `StressError::Workload`.
#[test]
fn unknown_workload_and_bad_parameter() {
    let session = session(MemorySessionConfig::default());
    assert!(matches!(
        stress(quick_config(10), &session, "Bogus"),
        Err(StressError::Workload(WorkloadError::Unknown(_)))
    ));

    let mut config = quick_config(10);
    config.workload_parameters.insert("ddl_every".into(), "sometimes".into());
    assert!(matches!(
        stress(config, &session, "CreateDrop"),
        Err(StressError::Workload(WorkloadError::InvalidParameter { .. }))
    ));
}

// ================================================================================================
// Failures and reporting
// ================================================================================================

/// # Scenario
/// Request failures are counted and reported, never fatal.
///
/// # Starting environment
/// Session failing every 5th request, writes only.
///
/// # Actions
/// 1. Run 100 iterations with a counting collector.
///
/// # Expected behavior
/// 20 errors, 80 timed operations, the collector saw all 100 and was
/// closed exactly once.
#[test]
fn failures_are_counted() {
    let session = session(MemorySessionConfig {
        fail_every: Some(5),
        ..MemorySessionConfig::default()
    });
    let collector = Arc::new(Counting::default());
    let config = StressConfig {
        read_rate: Some(0.0),
        ..quick_config(100)
    };

    let summary = stress(config, &session, "KeyValue")
        .unwrap()
        .with_collector(collector.clone())
        .run()
        .unwrap();

    assert_eq!(summary.errors, 20);
    assert_eq!(summary.total_operations(), 80);
    assert_eq!(collector.ok.load(Ordering::SeqCst), 80);
    assert_eq!(collector.failed.load(Ordering::SeqCst), 20);
    assert_eq!(collector.closed.load(Ordering::SeqCst), 1);
}

/// # Scenario
/// Populate-phase errors do not leak into the measured phase.
///
/// # Starting environment
/// Session failing every 10th request, `populate = 100`.
///
/// # Actions
/// 1. Run 10 write iterations after populate.
///
/// # Expected behavior
/// Only the single failure of the measured phase is reported.
#[test]
fn populate_errors_are_reset() {
    let session = session(MemorySessionConfig {
        fail_every: Some(10),
        ..MemorySessionConfig::default()
    });
    let config = StressConfig {
        populate: 100,
        read_rate: Some(0.0),
        ..quick_config(10)
    };
    let summary = stress(config, &session, "KeyValue").unwrap().run().unwrap();

    assert_eq!(summary.populate.count, 90);
    assert_eq!(summary.errors, 1);
    assert_eq!(session.stats().failures, 11);
}

/// # Scenario
/// A failing populate phase still tears the run down.
///
/// # Starting environment
/// Session whose submitting thread panics on the first insert,
/// `populate = 50`, a counting collector.
///
/// # Actions
/// 1. Run KeyValue.
///
/// # Expected behavior
/// The run fails with the panicked worker, the measured phase never
/// starts, and the collector is still closed exactly once.
#[test]
fn failed_populate_still_closes_collectors() {
    let memory = session(MemorySessionConfig::default());
    let collector = Arc::new(Counting::default());
    let config = StressConfig {
        populate: 50,
        ..quick_config(10)
    };
    let profile = WorkloadRegistry::builtin().create("KeyValue").unwrap();

    let result = Stress::new(config, Arc::new(PanicOnInsert(memory.clone())), profile)
        .unwrap()
        .with_collector(collector.clone())
        .run();

    assert!(matches!(result, Err(StressError::WorkerPanicked(0))));
    assert_eq!(memory.stats().requests, 0);
    assert_eq!(collector.closed.load(Ordering::SeqCst), 1);
}

// ================================================================================================
// Rate control
// ================================================================================================

/// # Scenario
/// The shared limiter caps traffic and the optimizer ramps it up.
///
/// # Starting environment
/// `rate = 1000`, 600ms duration, optimizer ticking every 100ms.
///
/// # Actions
/// 1. Run KeyValue for the duration.
///
/// # Expected behavior
/// The run starts at a tenth of the target rate, the optimizer steps it up
/// without exceeding the target, and far fewer than 1000 operations run.
#[test]
fn rate_limited_run_ramps_up() {
    let session = session(MemorySessionConfig::default());
    let config = StressConfig {
        iterations: None,
        duration: Some(Duration::from_millis(600)),
        rate: Some(1_000.0),
        max_write_latency: Some(50.0),
        optimizer_initial_delay: Duration::from_millis(100),
        optimizer_interval: Duration::from_millis(100),
        ..quick_config(0)
    };
    let summary = stress(config, &session, "KeyValue").unwrap().run().unwrap();

    let rate = summary.final_rate.unwrap();
    assert!(rate > 100.0 && rate <= 1_000.0, "final rate {rate}");
    assert!(summary.total_operations() > 0);
    assert!(summary.total_operations() < 1_000, "{} operations", summary.total_operations());
}

// ================================================================================================
// Concurrency
// ================================================================================================

/// # Scenario
/// Many threads write disjoint keyspaces concurrently.
///
/// # Starting environment
/// Four threads, 100 partitions each, sequence keys, writes only.
///
/// # Actions
/// 1. Run 250 iterations per thread.
///
/// # Expected behavior
/// All 1000 writes complete and exactly 400 distinct rows exist.
#[test]
fn threads_use_disjoint_keyspaces() {
    let session = session(MemorySessionConfig::default());
    let config = StressConfig {
        threads: 4,
        partition_key_generator: "sequence".into(),
        read_rate: Some(0.0),
        ..quick_config(250)
    };
    let summary = stress(config, &session, "KeyValue").unwrap().run().unwrap();

    assert_eq!(summary.mutations.count, 1_000);
    assert_eq!(session.row_count("keyvalue"), 400);
    assert!(session.get("keyvalue", "001.3.99").is_some());
}

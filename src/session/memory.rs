//! In-process [`Session`] backed by a background thread pool.
//!
//! Requests submitted through [`Session::execute_async`] are queued on an
//! unbounded channel and executed by a fixed set of named worker threads, so
//! completions arrive off the submitting thread exactly as they would from a
//! real driver. Each request optionally sleeps for a simulated latency,
//! then applies its effect to a small in-memory table store:
//!
//! - `INSERT` / `UPDATE` store the bound values under the routing key,
//! - `SELECT` returns the stored row (if any),
//! - `DELETE` removes it,
//! - `CREATE TABLE` / `DROP TABLE` create or drop a table.
//!
//! `IF` conditions are not evaluated: every write is stored and reports
//! itself applied.
//!
//! Failures can be injected deterministically with
//! [`MemorySessionConfig::fail_every`], and reads can be made to span several
//! pages with [`MemorySessionConfig::pages_per_read`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use super::{
    BoundStatement, Completion, PreparedStatement, Request, ResultSet, Row, Session,
    SessionError, StatementKind,
};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`MemorySession`].
#[derive(Debug, Clone)]
pub struct MemorySessionConfig {
    /// Number of threads completing asynchronous requests.
    ///
    /// Default: 4. Must be ≥ 1.
    pub pool_size: usize,

    /// Simulated server-side latency applied to every asynchronous request.
    ///
    /// Default: zero.
    pub latency: Duration,

    /// Number of pages a read result spans.
    ///
    /// Default: 1. Must be ≥ 1.
    pub pages_per_read: usize,

    /// Fail every n-th asynchronous request (1-based). `None` disables injection.
    ///
    /// Default: `None`. `Some(0)` is rejected.
    pub fail_every: Option<u64>,
}

impl Default for MemorySessionConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            latency: Duration::ZERO,
            pages_per_read: 1,
            fail_every: None,
        }
    }
}

impl MemorySessionConfig {
    fn validate(&self) -> Result<(), SessionError> {
        if self.pool_size < 1 {
            return Err(SessionError::Setup("pool_size must be >= 1".into()));
        }
        if self.pages_per_read < 1 {
            return Err(SessionError::Setup("pages_per_read must be >= 1".into()));
        }
        if self.fail_every == Some(0) {
            return Err(SessionError::Setup("fail_every must be >= 1".into()));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Counters of everything the session has executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySessionStats {
    pub requests: u64,
    pub inserts: u64,
    pub updates: u64,
    pub selects: u64,
    pub deletes: u64,
    pub schema: u64,
    pub failures: u64,
    pub pages_fetched: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    selects: AtomicU64,
    deletes: AtomicU64,
    schema: AtomicU64,
    failures: AtomicU64,
    pages_fetched: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

type Table = HashMap<String, Row>;

struct Shared {
    tables: RwLock<HashMap<String, Table>>,
    counters: Counters,
    latency: Duration,
    pages_per_read: usize,
    fail_every: Option<u64>,
}

impl Shared {
    /// Executes one asynchronous request, applying failure injection first.
    fn complete(self: &Arc<Self>, request: &Request) -> Result<Box<dyn ResultSet>, SessionError> {
        let n = self.counters.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(every) = self.fail_every {
            if n % every == 0 {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return Err(SessionError::Request(format!("injected failure #{n}")));
            }
        }
        self.apply(request)
    }

    fn apply(self: &Arc<Self>, request: &Request) -> Result<Box<dyn ResultSet>, SessionError> {
        match request {
            Request::Bound(bound) => self.apply_bound(bound),
            Request::Simple(text) => self.apply_text(text),
        }
    }

    fn apply_bound(self: &Arc<Self>, bound: &BoundStatement) -> Result<Box<dyn ResultSet>, SessionError> {
        let statement = bound.statement();
        let table = table_name(statement.query())
            .ok_or_else(|| SessionError::Request(format!("no table in '{}'", statement.query())))?;
        let key = routing_key(bound);

        let mut rows = Vec::new();
        match statement.kind() {
            StatementKind::Insert | StatementKind::Update => {
                let counter = if statement.kind() == StatementKind::Insert {
                    &self.counters.inserts
                } else {
                    &self.counters.updates
                };
                counter.fetch_add(1, Ordering::Relaxed);
                let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
                tables
                    .entry(table)
                    .or_default()
                    .insert(key, bound.values().to_vec());
            }
            StatementKind::Select => {
                self.counters.selects.fetch_add(1, Ordering::Relaxed);
                let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
                if let Some(row) = tables.get(&table).and_then(|t| t.get(&key)) {
                    rows.push(row.clone());
                }
                return Ok(Box::new(MemoryResultSet {
                    rows,
                    remaining_pages: self.pages_per_read - 1,
                    shared: Arc::clone(self),
                }));
            }
            StatementKind::Delete => {
                self.counters.deletes.fetch_add(1, Ordering::Relaxed);
                let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
                if let Some(t) = tables.get_mut(&table) {
                    t.remove(&key);
                }
            }
            StatementKind::Schema | StatementKind::Other => {
                return self.apply_text(statement.query());
            }
        }

        Ok(Box::new(MemoryResultSet {
            rows,
            remaining_pages: 0,
            shared: Arc::clone(self),
        }))
    }

    fn apply_text(self: &Arc<Self>, text: &str) -> Result<Box<dyn ResultSet>, SessionError> {
        if StatementKind::of(text) == StatementKind::Schema {
            self.counters.schema.fetch_add(1, Ordering::Relaxed);
            let upper = text.to_ascii_uppercase();
            if let Some(table) = table_name(text) {
                let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
                if upper.trim_start().starts_with("CREATE TABLE") {
                    tables.entry(table).or_default();
                } else if upper.trim_start().starts_with("DROP TABLE") {
                    tables.remove(&table);
                }
            }
        }
        Ok(Box::new(MemoryResultSet {
            rows: Vec::new(),
            remaining_pages: 0,
            shared: Arc::clone(self),
        }))
    }
}

/// Extracts the table a statement targets, ignoring `IF [NOT] EXISTS` and
/// trailing column lists.
fn table_name(query: &str) -> Option<String> {
    let tokens: Vec<&str> = query.split_whitespace().collect();
    let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
    let anchor = match upper.first().map(String::as_str) {
        Some("INSERT") => upper.iter().position(|t| t == "INTO"),
        Some("SELECT") | Some("DELETE") => upper.iter().position(|t| t == "FROM"),
        Some("UPDATE") => Some(0),
        Some("CREATE") | Some("DROP") | Some("ALTER") | Some("TRUNCATE") => {
            upper.iter().position(|t| t == "TABLE")
        }
        _ => None,
    }?;

    tokens
        .iter()
        .zip(upper.iter())
        .skip(anchor + 1)
        .find(|(_, up)| !matches!(up.as_str(), "IF" | "NOT" | "EXISTS"))
        .map(|(raw, _)| {
            raw.split(|c: char| c == '(' || c == ';')
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase()
        })
        .filter(|name| !name.is_empty())
}

/// The key a bound statement is stored under: its routing key, else its first value.
fn routing_key(bound: &BoundStatement) -> String {
    if let Some(key) = bound.routing_key() {
        return key.to_string();
    }
    match bound.values().first() {
        Some(super::Value::Text(s)) => s.clone(),
        Some(other) => format!("{other:?}"),
        None => String::new(),
    }
}

// ------------------------------------------------------------------------------------------------
// Result set
// ------------------------------------------------------------------------------------------------

struct MemoryResultSet {
    rows: Vec<Row>,
    remaining_pages: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryResultSet")
            .field("rows", &self.rows.len())
            .field("remaining_pages", &self.remaining_pages)
            .finish_non_exhaustive()
    }
}

impl ResultSet for MemoryResultSet {
    fn rows(&self) -> &[Row] {
        &self.rows
    }

    fn has_more_pages(&self) -> bool {
        self.remaining_pages > 0
    }

    fn fetch_next_page(&mut self) -> Result<(), SessionError> {
        if self.remaining_pages == 0 {
            return Ok(());
        }
        self.remaining_pages -= 1;
        self.rows.clear();
        self.shared
            .counters
            .pages_fetched
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

/// Holds the task sender and worker handles.
/// Taken (`Option::take`) on close to ensure single cleanup.
struct BackgroundPool {
    sender: crossbeam::channel::Sender<Box<dyn FnOnce() + Send>>,
    workers: Vec<thread::JoinHandle<()>>,
}

// ------------------------------------------------------------------------------------------------
// MemorySession
// ------------------------------------------------------------------------------------------------

/// An in-memory database session completing requests on a thread pool.
pub struct MemorySession {
    shared: Arc<Shared>,
    bg: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemorySession {
    /// Opens a session and spawns its completion pool.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Setup`] if the configuration is out of range
    /// or a worker thread cannot be spawned.
    pub fn open(config: MemorySessionConfig) -> Result<Self, SessionError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            tables: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            latency: config.latency,
            pages_per_read: config.pages_per_read,
            fail_every: config.fail_every,
        });

        let (sender, receiver) = crossbeam::channel::unbounded::<Box<dyn FnOnce() + Send>>();

        let mut workers = Vec::with_capacity(config.pool_size);
        for id in 0..config.pool_size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("memory-session-{id}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .map_err(|e| SessionError::Setup(format!("failed to spawn worker: {e}")))?;
            workers.push(handle);
        }
        // Workers hold their own receiver clones; drop ours.
        drop(receiver);

        info!(
            pool_size = config.pool_size,
            latency_us = config.latency.as_micros() as u64,
            "memory session opened"
        );

        Ok(Self {
            shared,
            bg: Mutex::new(Some(BackgroundPool { sender, workers })),
            closed: AtomicBool::new(false),
        })
    }

    /// Drains queued requests, joins the pool and rejects further requests.
    ///
    /// Calling `close` more than once is harmless.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_pool();
        info!("memory session closed");
    }

    pub fn stats(&self) -> MemorySessionStats {
        let c = &self.shared.counters;
        MemorySessionStats {
            requests: c.requests.load(Ordering::Relaxed),
            inserts: c.inserts.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            selects: c.selects.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            schema: c.schema.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            pages_fetched: c.pages_fetched.load(Ordering::Relaxed),
        }
    }

    /// Returns the row stored under `key` in `table`.
    pub fn get(&self, table: &str, key: &str) -> Option<Row> {
        let tables = self.shared.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(table).and_then(|t| t.get(key)).cloned()
    }

    pub fn table_exists(&self, table: &str) -> bool {
        let tables = self.shared.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.contains_key(table)
    }

    pub fn row_count(&self, table: &str) -> usize {
        let tables = self.shared.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(table).map_or(0, HashMap::len)
    }

    fn shutdown_pool(&self) {
        let pool = self.bg.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(bg) = pool {
            // Drop sender → workers drain remaining tasks then exit.
            drop(bg.sender);
            for worker in bg.workers {
                let _ = worker.join();
            }
        }
    }
}

impl Session for MemorySession {
    fn prepare(&self, query: &str) -> Result<PreparedStatement, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        if query.trim().is_empty() {
            return Err(SessionError::Prepare("empty statement".into()));
        }
        Ok(PreparedStatement::new(query))
    }

    fn execute(&self, query: &str) -> Result<Box<dyn ResultSet>, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        self.shared.apply_text(query)
    }

    fn execute_async(&self, request: Request, on_complete: Completion) {
        if self.closed.load(Ordering::Acquire) {
            on_complete(Err(SessionError::Closed));
            return;
        }

        let shared = Arc::clone(&self.shared);
        let task: Box<dyn FnOnce() + Send> = Box::new(move || {
            if !shared.latency.is_zero() {
                thread::sleep(shared.latency);
            }
            let result = shared.complete(&request);
            on_complete(result);
        });

        let rejected = {
            let guard = self.bg.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(bg) => bg.sender.send(task).err().map(|e| e.into_inner()),
                None => Some(task),
            }
        };

        // The task owns the completion; run it so the caller is still notified.
        if let Some(task) = rejected {
            debug!("memory session pool gone, completing inline");
            task();
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown_pool();
        }
    }
}

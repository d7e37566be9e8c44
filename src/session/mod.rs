//! # Session Module
//!
//! The narrow contract between the traffic engine and a database driver.
//!
//! The engine never speaks a wire protocol. It only needs to:
//!
//! - prepare statement templates ([`Session::prepare`]),
//! - run schema statements synchronously ([`Session::execute`]),
//! - submit a bound statement or raw statement text **asynchronously** and
//!   be told, exactly once, how it ended ([`Session::execute_async`]).
//!
//! Completions are delivered on driver-owned threads through a boxed
//! [`Completion`] closure. A successful completion carries a boxed
//! [`ResultSet`], which may expose further pages.
//!
//! [`memory::MemorySession`] is an in-process implementation backed by a
//! background thread pool, used for tests, benches and dry runs.

pub mod memory;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Failures reported by a [`Session`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The request reached the database and failed.
    #[error("request failed: {0}")]
    Request(String),

    /// The request did not complete in time.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Statement preparation failed.
    #[error("prepare failed: {0}")]
    Prepare(String),

    /// The session could not be opened (bad configuration, thread spawn failure).
    #[error("session setup failed: {0}")]
    Setup(String),

    /// The session has been closed.
    #[error("session is closed")]
    Closed,
}

// ------------------------------------------------------------------------------------------------
// Values and statements
// ------------------------------------------------------------------------------------------------

/// A bound parameter or a returned column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A row returned by a read.
pub type Row = Vec<Value>;

/// Coarse statement class, derived from the leading keyword of the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Update,
    Select,
    Delete,
    Schema,
    Other,
}

impl StatementKind {
    /// Classifies a statement by its first keyword (case-insensitive).
    pub fn of(query: &str) -> Self {
        let keyword = query
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match keyword.as_str() {
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "SELECT" => Self::Select,
            "DELETE" => Self::Delete,
            "CREATE" | "DROP" | "ALTER" | "TRUNCATE" => Self::Schema,
            _ => Self::Other,
        }
    }
}

/// A statement template accepted by the session, cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    query: Arc<str>,
    kind: StatementKind,
}

impl PreparedStatement {
    pub fn new(query: &str) -> Self {
        Self {
            kind: StatementKind::of(query),
            query: Arc::from(query),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// Binds positional values; the routing key is left unset.
    pub fn bind(&self, values: Vec<Value>) -> BoundStatement {
        BoundStatement {
            statement: self.clone(),
            values,
            routing_key: None,
        }
    }
}

/// A prepared statement plus its bound values, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    statement: PreparedStatement,
    values: Vec<Value>,
    routing_key: Option<String>,
}

impl BoundStatement {
    /// Sets the partition key the driver routes this request by.
    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn statement(&self) -> &PreparedStatement {
        &self.statement
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }
}

/// What gets submitted to [`Session::execute_async`].
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// A bound prepared statement (mutations, selects, deletions).
    Bound(BoundStatement),
    /// Raw statement text (DDL).
    Simple(String),
}

impl Request {
    pub fn kind(&self) -> StatementKind {
        match self {
            Self::Bound(bound) => bound.statement().kind(),
            Self::Simple(text) => StatementKind::of(text),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Results
// ------------------------------------------------------------------------------------------------

/// The successful outcome of a request.
///
/// A result may be paged: callers that need the whole partition keep calling
/// [`fetch_next_page`](ResultSet::fetch_next_page) while
/// [`has_more_pages`](ResultSet::has_more_pages) is true.
pub trait ResultSet: Send + fmt::Debug {
    /// Rows of the current page.
    fn rows(&self) -> &[Row];

    fn has_more_pages(&self) -> bool {
        false
    }

    /// Replaces the current page with the next one.
    fn fetch_next_page(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    /// Whether a conditional write was applied. Unconditional writes always are.
    fn was_applied(&self) -> bool {
        true
    }
}

/// Completion handler invoked exactly once per asynchronous request.
pub type Completion = Box<dyn FnOnce(Result<Box<dyn ResultSet>, SessionError>) + Send + 'static>;

// ------------------------------------------------------------------------------------------------
// Session trait
// ------------------------------------------------------------------------------------------------

/// An open connection to the database under test.
///
/// Implementations must be thread-safe: every worker thread submits through
/// the same session, and completions arrive on implementation-owned threads.
pub trait Session: Send + Sync {
    /// Prepares a statement template.
    fn prepare(&self, query: &str) -> Result<PreparedStatement, SessionError>;

    /// Executes a statement synchronously (schema setup).
    fn execute(&self, query: &str) -> Result<Box<dyn ResultSet>, SessionError>;

    /// Submits a request without waiting for it.
    ///
    /// `on_complete` must be invoked exactly once, with either the result or
    /// the error, and must not be invoked on the submitting thread while the
    /// caller still holds locks it needs.
    fn execute_async(&self, request: Request, on_complete: Completion);
}

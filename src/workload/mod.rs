//! # Workloads
//!
//! A workload profile defines one benchmark scenario: its schema, its
//! statement templates and its field generators. At run time it hands each
//! worker thread a [`WorkloadRunner`] that turns partition keys into
//! [`Operation`]s.
//!
//! Profiles are discovered through an explicit [`WorkloadRegistry`] (name →
//! factory) and tuned through named, typed [`WorkloadParameter`]s, parsed
//! and validated before any traffic starts.
//!
//! Built-in profiles:
//!
//! - [`KeyValue`]: insert, read and delete of a single text value by key.
//! - [`Locking`]: compare-and-set status flips with client-side state.
//! - [`CreateDrop`]: data traffic interleaved with table create/drop churn.

pub mod create_drop;
pub mod fields;
pub mod key_value;
pub mod locking;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

pub use create_drop::CreateDrop;
pub use fields::{Field, FieldGenerator, FieldRegistry, RandomText};
pub use key_value::KeyValue;
pub use locking::Locking;

use crate::StressConfig;
use crate::context::StressContext;
use crate::operation::Operation;
use crate::partition::{PartitionKey, PartitionKeyGenerator};
use crate::session::{ResultSet, Session, SessionError};

/// Read rate of profiles that do not state their own.
pub const DEFAULT_READ_RATE: f64 = 0.01;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("unknown workload '{0}'")]
    Unknown(String),

    #[error("workload '{workload}' has no parameter '{name}'")]
    UnknownParameter { workload: String, name: String },

    #[error("invalid value '{value}' for parameter '{name}': {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    /// `runner` was called before `prepare`.
    #[error("workload '{0}' was not prepared")]
    NotPrepared(&'static str),

    #[error("no field generator registered for {0}")]
    MissingField(String),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

// ------------------------------------------------------------------------------------------------
// Parameters
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Int,
    Float,
    Bool,
    Text,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Text => "text",
        })
    }
}

/// A tunable exposed by a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadParameter {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ParameterKind,
}

impl WorkloadParameter {
    pub const fn new(name: &'static str, description: &'static str, kind: ParameterKind) -> Self {
        Self {
            name,
            description,
            kind,
        }
    }
}

/// Parses a parameter value, mapping failures to [`WorkloadError::InvalidParameter`].
pub fn parse_parameter<T>(name: &str, value: &str) -> Result<T, WorkloadError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| WorkloadError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

// ------------------------------------------------------------------------------------------------
// Populate
// ------------------------------------------------------------------------------------------------

/// How a workload wants to be prepopulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateOption {
    /// `config.populate` rows; deletes follow the configured delete rate.
    Standard,
    /// A fixed row count, with or without deletes.
    Custom { rows: u64, deletes: bool },
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Per-thread operation factory handed out by a [`WorkloadProfile`].
///
/// `next_*` run on the queue's producer thread; `on_success` runs on
/// completion threads, concurrently with them. A runner may return
/// [`Operation::Stop`] from any `next_*` call to end generation early.
pub trait WorkloadRunner: Send + Sync {
    fn next_mutation(&self, key: &PartitionKey) -> Operation;

    fn next_select(&self, key: &PartitionKey) -> Operation;

    fn next_delete(&self, key: &PartitionKey) -> Operation;

    /// Operation used while prepopulating. Defaults to a mutation.
    fn next_populate(&self, key: &PartitionKey) -> Operation {
        self.next_mutation(key)
    }

    /// Called after a mutation or DDL operation succeeded.
    fn on_success(&self, _op: &Operation, _result: &dyn ResultSet) {}
}

/// One benchmark scenario.
pub trait WorkloadProfile: Send + Sync {
    fn name(&self) -> &'static str;

    /// Schema statements executed once before the run.
    fn schema(&self) -> Vec<String>;

    /// Prepares statement templates. Must succeed before [`runner`](Self::runner).
    fn prepare(&self, session: &dyn Session) -> Result<(), WorkloadError>;

    fn default_read_rate(&self) -> f64 {
        DEFAULT_READ_RATE
    }

    fn runner(&self, ctx: &StressContext) -> Result<Arc<dyn WorkloadRunner>, WorkloadError>;

    fn populate_option(&self, _config: &StressConfig) -> PopulateOption {
        PopulateOption::Standard
    }

    /// A generator replacing the thread's own during populate, keyed by `prefix`.
    fn populate_key_generator(&self, _prefix: &str) -> Option<PartitionKeyGenerator> {
        None
    }

    fn parameters(&self) -> Vec<WorkloadParameter> {
        Vec::new()
    }

    fn set_parameter(&mut self, name: &str, _value: &str) -> Result<(), WorkloadError> {
        Err(WorkloadError::UnknownParameter {
            workload: self.name().to_string(),
            name: name.to_string(),
        })
    }

    fn field_generators(&self) -> Vec<(Field, Arc<dyn FieldGenerator>)> {
        Vec::new()
    }
}

// ------------------------------------------------------------------------------------------------
// Registry
// ------------------------------------------------------------------------------------------------

pub type WorkloadFactory = fn() -> Box<dyn WorkloadProfile>;

/// Name → factory map of available workloads.
#[derive(Clone, Default)]
pub struct WorkloadRegistry {
    factories: BTreeMap<&'static str, WorkloadFactory>,
}

impl fmt::Debug for WorkloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in workloads.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("KeyValue", || -> Box<dyn WorkloadProfile> { Box::new(KeyValue::default()) });
        registry.register("Locking", || -> Box<dyn WorkloadProfile> { Box::new(Locking::default()) });
        registry.register("CreateDrop", || -> Box<dyn WorkloadProfile> { Box::new(CreateDrop::default()) });
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: WorkloadFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn WorkloadProfile>, WorkloadError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| WorkloadError::Unknown(name.to_string()))
    }

    /// Creates `name` and applies every parameter, failing on the first bad one.
    pub fn create_with<'a>(
        &self,
        name: &str,
        parameters: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Box<dyn WorkloadProfile>, WorkloadError> {
        let mut profile = self.create(name)?;
        for (key, value) in parameters {
            profile.set_parameter(key, value)?;
        }
        Ok(profile)
    }
}

//! Units of work flowing from a request queue to the database.
//!
//! Every real operation is stamped with its creation time when it is built
//! by the workload runner, on the producer thread and before queuing. The
//! latency recorded on completion is measured from that instant, so time
//! spent waiting in the queue counts against the database instead of being
//! silently omitted.

use std::time::Instant;

use crate::metrics::now_millis;
use crate::session::{BoundStatement, Request, Value};

/// Creation time of an operation, monotonic and wall-clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedAt {
    pub instant: Instant,
    pub millis: u64,
}

impl CreatedAt {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            millis: now_millis(),
        }
    }
}

/// Discriminant of [`Operation`], used for classification and metrics routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Mutation,
    Select,
    Deletion,
    Ddl,
    Stop,
}

/// Either a unit of work or the end-of-stream marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Mutation {
        statement: BoundStatement,
        /// Workload state carried to [`on_success`](crate::workload::WorkloadRunner::on_success).
        payload: Option<Value>,
        created: CreatedAt,
    },
    Select {
        statement: BoundStatement,
        created: CreatedAt,
    },
    Deletion {
        statement: BoundStatement,
        created: CreatedAt,
    },
    Ddl {
        statement: String,
        created: CreatedAt,
    },
    /// Terminal sentinel pushed once by a request queue after it drained.
    Stop,
}

impl Operation {
    pub fn mutation(statement: BoundStatement) -> Self {
        Self::Mutation {
            statement,
            payload: None,
            created: CreatedAt::now(),
        }
    }

    pub fn mutation_with_payload(statement: BoundStatement, payload: impl Into<Value>) -> Self {
        Self::Mutation {
            statement,
            payload: Some(payload.into()),
            created: CreatedAt::now(),
        }
    }

    pub fn select(statement: BoundStatement) -> Self {
        Self::Select {
            statement,
            created: CreatedAt::now(),
        }
    }

    pub fn deletion(statement: BoundStatement) -> Self {
        Self::Deletion {
            statement,
            created: CreatedAt::now(),
        }
    }

    pub fn ddl(statement: impl Into<String>) -> Self {
        Self::Ddl {
            statement: statement.into(),
            created: CreatedAt::now(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Mutation { .. } => OperationKind::Mutation,
            Self::Select { .. } => OperationKind::Select,
            Self::Deletion { .. } => OperationKind::Deletion,
            Self::Ddl { .. } => OperationKind::Ddl,
            Self::Stop => OperationKind::Stop,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }

    /// Creation stamp; `None` for [`Operation::Stop`].
    pub fn created(&self) -> Option<CreatedAt> {
        match self {
            Self::Mutation { created, .. }
            | Self::Select { created, .. }
            | Self::Deletion { created, .. }
            | Self::Ddl { created, .. } => Some(*created),
            Self::Stop => None,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Mutation { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }

    /// The request to submit; `None` for [`Operation::Stop`].
    pub fn request(&self) -> Option<Request> {
        match self {
            Self::Mutation { statement, .. }
            | Self::Select { statement, .. }
            | Self::Deletion { statement, .. } => Some(Request::Bound(statement.clone())),
            Self::Ddl { statement, .. } => Some(Request::Simple(statement.clone())),
            Self::Stop => None,
        }
    }
}

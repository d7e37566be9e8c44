//! Completion handling for submitted operations.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::error;

use crate::context::StressContext;
use crate::operation::{Operation, OperationKind};
use crate::session::{ResultSet, SessionError};
use crate::workload::WorkloadRunner;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    /// A `Stop` sentinel reached a completion handler. Always a defect.
    #[error("stop sentinel delivered to an operation callback")]
    UnexpectedStop,
}

/// Turns one operation's outcome into metrics, collector events and
/// workload hooks. Consumed by [`complete`](Self::complete), so it runs
/// exactly once.
pub struct OperationCallback {
    ctx: Arc<StressContext>,
    runner: Arc<dyn WorkloadRunner>,
    op: Operation,
    paginate: bool,
    populate_phase: bool,
    start_millis: u64,
    submitted: Instant,
}

impl OperationCallback {
    /// `start_millis` and `submitted` are taken right before submission.
    pub fn new(
        ctx: Arc<StressContext>,
        runner: Arc<dyn WorkloadRunner>,
        op: Operation,
        paginate: bool,
        populate_phase: bool,
        start_millis: u64,
        submitted: Instant,
    ) -> Self {
        Self {
            ctx,
            runner,
            op,
            paginate,
            populate_phase,
            start_millis,
            submitted,
        }
    }

    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Handles the outcome. Failures are counted, collected and logged;
    /// they never abort the run.
    ///
    /// # Errors
    ///
    /// [`CallbackError::UnexpectedStop`] if the operation is a `Stop`.
    pub fn complete(self, result: Result<Box<dyn ResultSet>, SessionError>) -> Result<(), CallbackError> {
        let created = self.op.created().ok_or(CallbackError::UnexpectedStop)?;

        let mut rs = match result {
            Ok(rs) => rs,
            Err(e) => {
                self.fail(&e);
                return Ok(());
            }
        };

        if self.paginate {
            while rs.has_more_pages() {
                if let Err(e) = rs.fetch_next_page() {
                    self.fail(&e);
                    return Ok(());
                }
            }
        }

        let timer = self.ctx.timer(&self.op, self.populate_phase)?;
        timer.update(created.instant.elapsed());

        self.ctx
            .collect(&self.op, Ok(&*rs), self.start_millis, self.submitted.elapsed());

        if matches!(self.op.kind(), OperationKind::Mutation | OperationKind::Ddl) {
            self.runner.on_success(&self.op, &*rs);
        }
        Ok(())
    }

    fn fail(&self, e: &SessionError) {
        self.ctx.metrics.errors().mark();
        self.ctx
            .collect(&self.op, Err(e), self.start_millis, self.submitted.elapsed());
        error!(
            thread = self.ctx.thread_id,
            kind = ?self.op.kind(),
            error = %e,
            "operation failed"
        );
    }
}

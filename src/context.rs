//! Per-thread bundle of shared run state.

use std::sync::Arc;
use std::time::Duration;

use crate::StressConfig;
use crate::collector::{Collector, Outcome};
use crate::limiter::RateLimiter;
use crate::metrics::{Metrics, Timer};
use crate::operation::Operation;
use crate::runner::CallbackError;
use crate::session::Session;
use crate::workload::FieldRegistry;

/// Everything a worker thread needs, shared by reference.
///
/// One instance per worker thread; only `thread_id` differs between them.
/// Immutable after construction apart from the interior state of `metrics`.
#[derive(Clone)]
pub struct StressContext {
    pub session: Arc<dyn Session>,
    pub config: Arc<StressConfig>,
    pub thread_id: usize,
    pub metrics: Arc<Metrics>,
    pub fields: Arc<FieldRegistry>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub collector: Arc<dyn Collector>,
}

impl std::fmt::Debug for StressContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StressContext")
            .field("thread_id", &self.thread_id)
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}

impl StressContext {
    /// The same context for another worker thread.
    pub fn for_thread(&self, thread_id: usize) -> Self {
        Self {
            thread_id,
            ..self.clone()
        }
    }

    /// Partition key prefix owned by this thread: `"{id}.{thread}."`.
    pub fn key_prefix(&self) -> String {
        format!("{}.{}.", self.config.id, self.thread_id)
    }

    pub fn collect(&self, op: &Operation, outcome: Outcome<'_>, start_millis: u64, duration: Duration) {
        self.collector.collect(self, op, outcome, start_millis, duration);
    }

    /// The timer a completed `op` is recorded in.
    ///
    /// # Errors
    ///
    /// [`CallbackError::UnexpectedStop`] for [`Operation::Stop`].
    pub fn timer(&self, op: &Operation, populate_phase: bool) -> Result<&Arc<Timer>, CallbackError> {
        self.metrics
            .timer_for(op.kind(), populate_phase)
            .ok_or(CallbackError::UnexpectedStop)
    }
}

//! # Collectors
//!
//! The reporting-sink seam. Every completed operation, successful or not,
//! is handed to the run's [`Collector`] together with its submission time
//! and how long it took. What a collector does with it (console output,
//! files, histograms) is outside the engine.
//!
//! Collectors are called concurrently from completion threads and must not
//! block for long.


use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::context::StressContext;
use crate::operation::Operation;
use crate::session::{ResultSet, SessionError};

/// How an operation ended.
pub type Outcome<'a> = Result<&'a dyn ResultSet, &'a SessionError>;

/// Receives one event per completed operation.
pub trait Collector: Send + Sync {
    /// `start_millis` is the wall-clock submission time, `duration` the time
    /// from submission to completion.
    fn collect(
        &self,
        ctx: &StressContext,
        op: &Operation,
        outcome: Outcome<'_>,
        start_millis: u64,
        duration: Duration,
    );

    /// Called once at the end of the run.
    fn close(&self, _ctx: &StressContext) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

impl Collector for NoopCollector {
    fn collect(&self, _: &StressContext, _: &Operation, _: Outcome<'_>, _: u64, _: Duration) {}
}

/// Fans every event out to each member, in order.
#[derive(Default, Clone)]
pub struct CompositeCollector {
    collectors: Vec<Arc<dyn Collector>>,
}

impl CompositeCollector {
    pub fn new(collectors: Vec<Arc<dyn Collector>>) -> Self {
        Self { collectors }
    }

    pub fn push(&mut self, collector: Arc<dyn Collector>) {
        self.collectors.push(collector);
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}

impl Collector for CompositeCollector {
    fn collect(
        &self,
        ctx: &StressContext,
        op: &Operation,
        outcome: Outcome<'_>,
        start_millis: u64,
        duration: Duration,
    ) {
        for collector in &self.collectors {
            collector.collect(ctx, op, outcome, start_millis, duration);
        }
    }

    fn close(&self, ctx: &StressContext) {
        debug!(collectors = self.collectors.len(), "closing collectors");
        for collector in &self.collectors {
            collector.close(ctx);
        }
    }
}

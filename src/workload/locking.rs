//! Compare-and-set status flips.
//!
//! Every key holds a `status` of 0 or 1. A mutation flips it with a
//! conditional update guarded by the status the runner last saw succeed.
//! The runner's view is only advanced in `on_success`, from the status the
//! mutation carried as its payload, and only if the update was applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, trace};

use super::{PopulateOption, WorkloadError, WorkloadProfile, WorkloadRunner};
use crate::StressConfig;
use crate::context::StressContext;
use crate::operation::Operation;
use crate::partition::{PartitionKey, PartitionKeyGenerator};
use crate::session::{PreparedStatement, ResultSet, Session, Value};

#[derive(Debug, Clone)]
struct Statements {
    insert: PreparedStatement,
    update: PreparedStatement,
    select: PreparedStatement,
    delete: PreparedStatement,
}

/// Lightweight-transaction style locking workload.
///
/// Populates every partition exactly once, in sequence, without deletes.
#[derive(Debug, Default)]
pub struct Locking {
    statements: OnceLock<Statements>,
}

impl WorkloadProfile for Locking {
    fn name(&self) -> &'static str {
        "Locking"
    }

    fn schema(&self) -> Vec<String> {
        vec![
            "CREATE TABLE IF NOT EXISTS lwtupdates (\n    item_id text PRIMARY KEY,\n    name text,\n    status int\n)"
                .to_string(),
        ]
    }

    fn prepare(&self, session: &dyn Session) -> Result<(), WorkloadError> {
        if self.statements.get().is_some() {
            return Ok(());
        }
        let statements = Statements {
            insert: session.prepare("INSERT INTO lwtupdates (item_id, name, status) VALUES (?, ?, 0)")?,
            update: session.prepare("UPDATE lwtupdates SET status = ? WHERE item_id = ? IF status = ?")?,
            select: session.prepare("SELECT * FROM lwtupdates WHERE item_id = ?")?,
            delete: session.prepare("DELETE FROM lwtupdates WHERE item_id = ? IF EXISTS")?,
        };
        let _ = self.statements.set(statements);
        debug!(workload = self.name(), "statements prepared");
        Ok(())
    }

    fn runner(&self, ctx: &StressContext) -> Result<Arc<dyn WorkloadRunner>, WorkloadError> {
        let statements = self
            .statements
            .get()
            .cloned()
            .ok_or(WorkloadError::NotPrepared("Locking"))?;
        let capacity = usize::try_from(ctx.config.partition_values).unwrap_or(usize::MAX).min(1 << 20);
        Ok(Arc::new(LockingRunner {
            statements,
            state: Mutex::new(HashMap::with_capacity(capacity)),
        }))
    }

    fn populate_option(&self, config: &StressConfig) -> PopulateOption {
        PopulateOption::Custom {
            rows: config.partition_values,
            deletes: false,
        }
    }

    fn populate_key_generator(&self, prefix: &str) -> Option<PartitionKeyGenerator> {
        Some(PartitionKeyGenerator::sequence(prefix))
    }
}

struct LockingRunner {
    statements: Statements,
    /// Last applied status per key.
    state: Mutex<HashMap<String, i64>>,
}

impl LockingRunner {
    fn status(&self, key: &str) -> i64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.get(key).copied().unwrap_or(0)
    }
}

impl WorkloadRunner for LockingRunner {
    fn next_mutation(&self, key: &PartitionKey) -> Operation {
        let text = key.text();
        let current = self.status(&text);
        let next = if current == 0 { 1 } else { 0 };
        trace!(key = %text, from = current, to = next, "flipping status");

        let bound = self
            .statements
            .update
            .bind(vec![Value::Int(next), text.clone().into(), Value::Int(current)])
            .with_routing_key(text);
        Operation::mutation_with_payload(bound, next)
    }

    fn next_select(&self, key: &PartitionKey) -> Operation {
        let text = key.text();
        let bound = self
            .statements
            .select
            .bind(vec![text.clone().into()])
            .with_routing_key(text);
        Operation::select(bound)
    }

    fn next_delete(&self, key: &PartitionKey) -> Operation {
        let text = key.text();
        let bound = self
            .statements
            .delete
            .bind(vec![text.clone().into()])
            .with_routing_key(text);
        Operation::deletion(bound)
    }

    fn next_populate(&self, key: &PartitionKey) -> Operation {
        let text = key.text();
        let bound = self
            .statements
            .insert
            .bind(vec![text.clone().into(), "test".into()])
            .with_routing_key(text);
        Operation::mutation(bound)
    }

    fn on_success(&self, op: &Operation, result: &dyn ResultSet) {
        let Operation::Mutation {
            statement, payload, ..
        } = op
        else {
            return;
        };
        let (Some(key), Some(status)) = (statement.routing_key(), payload.as_ref().and_then(Value::as_int))
        else {
            return;
        };
        if !result.was_applied() {
            trace!(key, "conditional update not applied");
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.insert(key.to_string(), status);
    }
}

//! Single-value key/value traffic.

use std::sync::{Arc, OnceLock};

use tracing::debug;

use super::{Field, FieldGenerator, RandomText, WorkloadError, WorkloadProfile, WorkloadRunner};
use crate::context::StressContext;
use crate::operation::Operation;
use crate::partition::PartitionKey;
use crate::session::{PreparedStatement, Session};

const TABLE: &str = "keyvalue";

#[derive(Debug, Clone)]
struct Statements {
    insert: PreparedStatement,
    select: PreparedStatement,
    delete: PreparedStatement,
}

/// Inserts a random text value per key, reads it back, deletes it.
///
/// Reads half of the time unless a read rate is configured.
#[derive(Debug, Default)]
pub struct KeyValue {
    statements: OnceLock<Statements>,
}

impl WorkloadProfile for KeyValue {
    fn name(&self) -> &'static str {
        "KeyValue"
    }

    fn schema(&self) -> Vec<String> {
        vec![
            "CREATE TABLE IF NOT EXISTS keyvalue (\n    key text PRIMARY KEY,\n    value text\n)".to_string(),
        ]
    }

    fn prepare(&self, session: &dyn Session) -> Result<(), WorkloadError> {
        if self.statements.get().is_some() {
            return Ok(());
        }
        let statements = Statements {
            insert: session.prepare("INSERT INTO keyvalue (key, value) VALUES (?, ?)")?,
            select: session.prepare("SELECT * FROM keyvalue WHERE key = ?")?,
            delete: session.prepare("DELETE FROM keyvalue WHERE key = ?")?,
        };
        let _ = self.statements.set(statements);
        debug!(workload = self.name(), "statements prepared");
        Ok(())
    }

    fn default_read_rate(&self) -> f64 {
        0.5
    }

    fn runner(&self, ctx: &StressContext) -> Result<Arc<dyn WorkloadRunner>, WorkloadError> {
        let statements = self
            .statements
            .get()
            .cloned()
            .ok_or(WorkloadError::NotPrepared("KeyValue"))?;
        let value = ctx.fields.generator(TABLE, "value")?;
        Ok(Arc::new(KeyValueRunner { statements, value }))
    }

    fn field_generators(&self) -> Vec<(Field, Arc<dyn FieldGenerator>)> {
        vec![(Field::new(TABLE, "value"), Arc::new(RandomText::new(100, 200)))]
    }
}

struct KeyValueRunner {
    statements: Statements,
    value: Arc<dyn FieldGenerator>,
}

impl WorkloadRunner for KeyValueRunner {
    fn next_mutation(&self, key: &PartitionKey) -> Operation {
        let text = key.text();
        let bound = self
            .statements
            .insert
            .bind(vec![text.clone().into(), self.value.text().into()])
            .with_routing_key(text);
        Operation::mutation(bound)
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
}

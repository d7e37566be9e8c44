//! Data traffic under schema churn.
//!
//! Each worker thread keeps a rotation of up to `active_tables` tables.
//! Every `ddl_every` mutations, the runner emits a DDL operation instead:
//! a `CREATE TABLE` while the rotation has room, otherwise a `DROP TABLE`
//! of the oldest table. A created table joins the rotation only once its
//! DDL has succeeded; a dropped table leaves it as soon as the drop is
//! issued, so no further traffic targets it.
//!
//! Only confirmed tables count against `active_tables`. A create that never
//! succeeds is simply retried on the next DDL tick. Unconfirmed creates are
//! remembered up to `active_tables` at a time, oldest forgotten first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use tracing::{info, warn};

use super::{
    Field, FieldGenerator, ParameterKind, RandomText, WorkloadError, WorkloadParameter, WorkloadProfile,
    WorkloadRunner, parse_parameter,
};
use crate::context::StressContext;
use crate::operation::Operation;
use crate::partition::PartitionKey;
use crate::session::{PreparedStatement, ResultSet, Session, Value};

const FIELD_TABLE: &str = "create_drop";

const PARAMETERS: [WorkloadParameter; 3] = [
    WorkloadParameter::new("fields", "Number of fields in each table.", ParameterKind::Int),
    WorkloadParameter::new("active_tables", "Number of tables to keep active.", ParameterKind::Int),
    WorkloadParameter::new("ddl_every", "Mutations between two DDL operations.", ParameterKind::Int),
];

#[derive(Debug, Clone)]
pub struct CreateDrop {
    fields: usize,
    active_tables: usize,
    ddl_every: u64,
}

impl Default for CreateDrop {
    fn default() -> Self {
        Self {
            fields: 1,
            active_tables: 10,
            ddl_every: 1000,
        }
    }
}

impl CreateDrop {
    pub fn fields(&self) -> usize {
        self.fields
    }

    pub fn active_tables(&self) -> usize {
        self.active_tables
    }

    pub fn ddl_every(&self) -> u64 {
        self.ddl_every
    }
}

fn positive<T: PartialOrd + Default>(name: &str, raw: &str, value: T) -> Result<T, WorkloadError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(WorkloadError::InvalidParameter {
            name: name.to_string(),
            value: raw.to_string(),
            reason: "must be at least 1".to_string(),
        })
    }
}

impl WorkloadProfile for CreateDrop {
    fn name(&self) -> &'static str {
        "CreateDrop"
    }

    fn schema(&self) -> Vec<String> {
        Vec::new()
    }

    /// Tables are created per thread by the runner.
    fn prepare(&self, _session: &dyn Session) -> Result<(), WorkloadError> {
        Ok(())
    }

    fn default_read_rate(&self) -> f64 {
        0.0
    }

    fn runner(&self, ctx: &StressContext) -> Result<Arc<dyn WorkloadRunner>, WorkloadError> {
        let columns: Vec<String> = (0..self.fields).map(|i| format!("f{i}")).collect();
        let runner = CreateDropRunner {
            session: Arc::clone(&ctx.session),
            name_prefix: format!("create_drop_{}_{}", ctx.thread_id, ctx.config.id),
            columns,
            active_tables: self.active_tables,
            ddl_every: self.ddl_every,
            mutations: AtomicU64::new(0),
            field: ctx.fields.generator(FIELD_TABLE, "f")?,
            state: Mutex::new(Rotation::default()),
        };

        // The first table is created synchronously so traffic always has a target.
        let (name, create) = runner.next_table();
        runner.session.execute(&create)?;
        let table = runner.prepare_table(name)?;
        runner.rotation().tables.push_back(table);

        info!(
            thread = ctx.thread_id,
            ddl_every = self.ddl_every,
            active_tables = self.active_tables,
            "create/drop runner ready"
        );
        Ok(Arc::new(runner))
    }

    fn parameters(&self) -> Vec<WorkloadParameter> {
        PARAMETERS.to_vec()
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> Result<(), WorkloadError> {
        match name {
            "fields" => self.fields = positive(name, value, parse_parameter::<usize>(name, value)?)?,
            "active_tables" => self.active_tables = positive(name, value, parse_parameter::<usize>(name, value)?)?,
            "ddl_every" => self.ddl_every = positive(name, value, parse_parameter::<u64>(name, value)?)?,
            _ => {
                return Err(WorkloadError::UnknownParameter {
                    workload: self.name().to_string(),
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn field_generators(&self) -> Vec<(Field, Arc<dyn FieldGenerator>)> {
        vec![(Field::new(FIELD_TABLE, "f"), Arc::new(RandomText::new(10, 20)))]
    }
}

#[derive(Debug, Clone)]
struct Table {
    name: String,
    insert: PreparedStatement,
    select: PreparedStatement,
    delete: PreparedStatement,
}

#[derive(Debug, Default)]
struct Rotation {
    tables: VecDeque<Table>,
    /// `(CREATE statement, table name)` for unconfirmed creates, oldest first.
    pending: VecDeque<(String, String)>,
    created: u64,
}

struct CreateDropRunner {
    session: Arc<dyn Session>,
    name_prefix: String,
    columns: Vec<String>,
    active_tables: usize,
    ddl_every: u64,
    mutations: AtomicU64,
    field: Arc<dyn FieldGenerator>,
    state: Mutex<Rotation>,
}

impl CreateDropRunner {
    fn rotation(&self) -> std::sync::MutexGuard<'_, Rotation> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves the next table name and returns it with its CREATE statement.
    fn next_table(&self) -> (String, String) {
        let mut rotation = self.rotation();
        rotation.created += 1;
        let name = format!("{}_{}", self.name_prefix, rotation.created);
        let typed: Vec<String> = self.columns.iter().map(|c| format!("{c} text")).collect();
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {name} (id text, {}, PRIMARY KEY (id))",
            typed.join(", ")
        );
        (name, create)
    }

    fn prepare_table(&self, name: String) -> Result<Table, WorkloadError> {
        let placeholders = vec!["?"; self.columns.len()].join(", ");
        let insert = format!(
            "INSERT INTO {name} (id, {}) VALUES (?, {placeholders})",
            self.columns.join(", ")
        );
        Ok(Table {
            insert: self.session.prepare(&insert)?,
            select: self.session.prepare(&format!("SELECT * FROM {name} WHERE id = ?"))?,
            delete: self.session.prepare(&format!("DELETE FROM {name} WHERE id = ?"))?,
            name,
        })
    }

    /// A random table, avoiding the oldest (next to be dropped) when possible.
    fn pick(&self) -> Option<Table> {
        let rotation = self.rotation();
        let len = rotation.tables.len();
        let index = if len > 1 { rand::rng().random_range(1..len) } else { 0 };
        rotation.tables.get(index).cloned()
    }

    fn next_ddl(&self) -> Option<Operation> {
        let room = self.rotation().tables.len() < self.active_tables;
        if room {
            let (name, create) = self.next_table();
            let mut rotation = self.rotation();
            if rotation.pending.len() >= self.active_tables {
                if let Some((_, lost)) = rotation.pending.pop_front() {
                    warn!(table = %lost, "create never confirmed, giving up on it");
                }
            }
            rotation.pending.push_back((create.clone(), name));
            return Some(Operation::ddl(create));
        }

        let mut rotation = self.rotation();
        if rotation.tables.len() > 1 {
            let oldest = rotation.tables.pop_front()?;
            return Some(Operation::ddl(format!("DROP TABLE IF EXISTS {}", oldest.name)));
        }
        None
    }

    fn keyed(&self, key: &PartitionKey, build: impl FnOnce(&Table, String) -> Operation) -> Operation {
        match self.pick() {
            Some(table) => build(&table, key.text()),
            None => {
                warn!("no table available, ending generation");
                Operation::Stop
            }
        }
    }
}

impl WorkloadRunner for CreateDropRunner {
    fn next_mutation(&self, key: &PartitionKey) -> Operation {
        let n = self.mutations.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.ddl_every == 0 {
            if let Some(ddl) = self.next_ddl() {
                return ddl;
            }
        }

        self.keyed(key, |table, text| {
            let mut values: Vec<Value> = Vec::with_capacity(self.columns.len() + 1);
            values.push(text.clone().into());
            values.extend((0..self.columns.len()).map(|_| Value::Text(self.field.text())));
            Operation::mutation(table.insert.bind(values).with_routing_key(text))
        })
    }

    fn next_select(&self, key: &PartitionKey) -> Operation {
        self.keyed(key, |table, text| {
            Operation::select(table.select.bind(vec![text.clone().into()]).with_routing_key(text))
        })
    }

    fn next_delete(&self, key: &PartitionKey) -> Operation {
        self.keyed(key, |table, text| {
            Operation::deletion(table.delete.bind(vec![text.clone().into()]).with_routing_key(text))
        })
    }

    fn on_success(&self, op: &Operation, _result: &dyn ResultSet) {
        let Operation::Ddl { statement, .. } = op else {
            return;
        };
        let name = {
            let mut rotation = self.rotation();
            let Some(index) = rotation.pending.iter().position(|(create, _)| create == statement) else {
                return;
            };
            match rotation.pending.remove(index) {
                Some((_, name)) => name,
                None => return,
            }
        };
        match self.prepare_table(name) {
            Ok(table) => {
                info!(table = %table.name, "table joined rotation");
                self.rotation().tables.push_back(table);
            }
            Err(e) => warn!(error = %e, "failed to prepare statements for new table"),
        }
    }
}

//! Field value generators.
//!
//! Workloads ask the [`FieldRegistry`] for the generator of a `(table, field)`
//! pair when they build their runner. Each workload registers defaults;
//! callers may replace any of them with an override before the run starts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use rand::distr::{Distribution, Uniform};

use super::WorkloadError;

/// Identifies one column of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub table: String,
    pub name: String,
}

impl Field {
    pub fn new(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.name)
    }
}

/// Produces values for one field on demand. Called from producer threads.
pub trait FieldGenerator: Send + Sync {
    fn text(&self) -> String;

    fn description(&self) -> &str {
        ""
    }
}

/// Upper-case ASCII text whose length is uniform in `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomText {
    min: usize,
    max: usize,
}

impl RandomText {
    /// `max` is raised to `min + 1` when the range is empty.
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min,
            max: max.max(min + 1),
        }
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

impl FieldGenerator for RandomText {
    fn text(&self) -> String {
        let mut rng = rand::rng();
        let len = rng.random_range(self.min..self.max);
        match Uniform::new_inclusive(b'A', b'Z') {
            Ok(letters) => letters.sample_iter(&mut rng).take(len).map(char::from).collect(),
            Err(_) => String::new(),
        }
    }

    fn description(&self) -> &str {
        "Completely random text with even distribution."
    }
}

/// `(table, field)` → generator lookup with per-run overrides.
#[derive(Default, Clone)]
pub struct FieldRegistry {
    defaults: HashMap<Field, Arc<dyn FieldGenerator>>,
    overrides: HashMap<Field, Arc<dyn FieldGenerator>>,
}

impl fmt::Debug for FieldRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut defaults: Vec<String> = self.defaults.keys().map(Field::to_string).collect();
        defaults.sort();
        let mut overrides: Vec<String> = self.overrides.keys().map(Field::to_string).collect();
        overrides.sort();
        f.debug_struct("FieldRegistry")
            .field("defaults", &defaults)
            .field("overrides", &overrides)
            .finish()
    }
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with a workload's default generators.
    pub fn with_defaults(defaults: impl IntoIterator<Item = (Field, Arc<dyn FieldGenerator>)>) -> Self {
        Self {
            defaults: defaults.into_iter().collect(),
            overrides: HashMap::new(),
        }
    }

    pub fn set_default(&mut self, field: Field, generator: Arc<dyn FieldGenerator>) {
        self.defaults.insert(field, generator);
    }

    pub fn set_override(&mut self, field: Field, generator: Arc<dyn FieldGenerator>) {
        self.overrides.insert(field, generator);
    }

    pub fn contains(&self, table: &str, name: &str) -> bool {
        let field = Field::new(table, name);
        self.overrides.contains_key(&field) || self.defaults.contains_key(&field)
    }

    /// The override for the field if there is one, else its default.
    ///
    /// # Errors
    ///
    /// [`WorkloadError::MissingField`] if neither exists.
    pub fn generator(&self, table: &str, name: &str) -> Result<Arc<dyn FieldGenerator>, WorkloadError> {
        let field = Field::new(table, name);
        self.overrides
            .get(&field)
            .or_else(|| self.defaults.get(&field))
            .cloned()
            .ok_or_else(|| WorkloadError::MissingField(field.to_string()))
    }
}

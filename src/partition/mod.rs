//! # Partition Key Generation
//!
//! Produces the stream of partition keys that drives every request queue.
//!
//! A [`PartitionKeyGenerator`] is a cheap, cloneable description of *how*
//! keys are drawn (the [`KeyDistribution`]) and *which keyspace* they live in
//! (the prefix). Calling [`PartitionKeyGenerator::generate_key`] returns a
//! lazy [`PartitionKeys`] iterator that owns its own random state, so the
//! iterator can be moved into a producer thread.
//!
//! ## Distributions
//!
//! - **sequence**: deterministic round-robin over `[0, max_id)`, wrapping.
//!   Required by workloads that need stable key identity across phases.
//! - **random**: uniform pick in `[0, max_id)`.
//! - **normal**: Gaussian pick centred at `max_id / 2`, clamped into
//!   `[0, max_id)`, to model hot-spot access patterns.
//!
//! ## Keyspaces
//!
//! Each worker thread derives its prefix from the run id and its thread
//! index (`"{id}.{thread}."`), so concurrent threads and concurrent runs
//! never collide.


use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while constructing a key generator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyGeneratorError {
    /// The configured generator name is not one of `sequence`, `random`, `normal`.
    #[error("unknown partition key generator '{0}' (expected one of: sequence, random, normal)")]
    Unknown(String),
}

// ------------------------------------------------------------------------------------------------
// PartitionKey
// ------------------------------------------------------------------------------------------------

/// A single partition key: a keyspace prefix plus a numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    prefix: String,
    id: u64,
}

impl PartitionKey {
    pub fn new(prefix: impl Into<String>, id: u64) -> Self {
        Self {
            prefix: prefix.into(),
            id,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The database-facing key: prefix immediately followed by the id.
    pub fn text(&self) -> String {
        format!("{}{}", self.prefix, self.id)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.id)
    }
}

// ------------------------------------------------------------------------------------------------
// KeyDistribution
// ------------------------------------------------------------------------------------------------

/// Selects how partition key ids are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDistribution {
    /// Round-robin `0, 1, ..., max_id - 1, 0, ...`.
    Sequence,
    /// Uniform over `[0, max_id)`.
    Random,
    /// Gaussian around `max_id / 2`, clamped into `[0, max_id)`.
    Normal,
}

impl KeyDistribution {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Random => "random",
            Self::Normal => "normal",
        }
    }
}

impl FromStr for KeyDistribution {
    type Err = KeyGeneratorError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "sequence" => Ok(Self::Sequence),
            "random" => Ok(Self::Random),
            "normal" => Ok(Self::Normal),
            other => Err(KeyGeneratorError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for KeyDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ------------------------------------------------------------------------------------------------
// PartitionKeyGenerator
// ------------------------------------------------------------------------------------------------

/// Describes a keyspace and a distribution; produces [`PartitionKeys`] on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKeyGenerator {
    prefix: String,
    distribution: KeyDistribution,
}

impl PartitionKeyGenerator {
    pub fn new(prefix: impl Into<String>, distribution: KeyDistribution) -> Self {
        Self {
            prefix: prefix.into(),
            distribution,
        }
    }

    pub fn sequence(prefix: impl Into<String>) -> Self {
        Self::new(prefix, KeyDistribution::Sequence)
    }

    pub fn random(prefix: impl Into<String>) -> Self {
        Self::new(prefix, KeyDistribution::Random)
    }

    pub fn normal(prefix: impl Into<String>) -> Self {
        Self::new(prefix, KeyDistribution::Normal)
    }

    /// Resolves a generator by its configured name.
    ///
    /// # Errors
    ///
    /// Returns [`KeyGeneratorError::Unknown`] for any name other than
    /// `sequence`, `random` or `normal`. There is no fallback.
    pub fn from_name(name: &str, prefix: impl Into<String>) -> Result<Self, KeyGeneratorError> {
        let distribution = name.parse::<KeyDistribution>()?;
        Ok(Self::new(prefix, distribution))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn distribution(&self) -> KeyDistribution {
        self.distribution
    }

    /// Returns a lazy stream of at most `total_values` keys with ids in `[0, max_id)`.
    ///
    /// `u64::MAX` is used by duration-bounded runs as "unbounded". A `max_id`
    /// of zero is treated as one so the stream is never empty for lack of ids.
    pub fn generate_key(&self, total_values: u64, max_id: u64) -> PartitionKeys {
        let max_id = max_id.max(1);
        let sampler = match self.distribution {
            KeyDistribution::Sequence => Sampler::Sequence { next: 0 },
            KeyDistribution::Random => Sampler::Uniform,
            KeyDistribution::Normal => {
                let mean = max_id as f64 / 2.0;
                let std_dev = (max_id as f64 / 6.0).max(f64::MIN_POSITIVE);
                match Normal::new(mean, std_dev) {
                    Ok(normal) => Sampler::Gaussian(normal),
                    // Only reachable for non-finite parameters; degrade to uniform.
                    Err(_) => Sampler::Uniform,
                }
            }
        };

        PartitionKeys {
            prefix: self.prefix.clone(),
            max_id,
            remaining: total_values,
            sampler,
            rng: StdRng::from_os_rng(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PartitionKeys iterator
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
enum Sampler {
    Sequence { next: u64 },
    Uniform,
    Gaussian(Normal<f64>),
}

/// Lazy key stream returned by [`PartitionKeyGenerator::generate_key`].
#[derive(Debug)]
pub struct PartitionKeys {
    prefix: String,
    max_id: u64,
    remaining: u64,
    sampler: Sampler,
    rng: StdRng,
}

impl PartitionKeys {
    fn next_id(&mut self) -> u64 {
        match &mut self.sampler {
            Sampler::Sequence { next } => {
                let id = *next;
                *next = (id + 1) % self.max_id;
                id
            }
            Sampler::Uniform => self.rng.random_range(0..self.max_id),
            Sampler::Gaussian(normal) => {
                let drawn = normal.sample(&mut self.rng);
                clamp_to_range(drawn, self.max_id)
            }
        }
    }
}

/// Maps a real-valued draw into `[0, max_id)`.
fn clamp_to_range(value: f64, max_id: u64) -> u64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    let upper = max_id - 1;
    if value >= upper as f64 {
        upper
    } else {
        value as u64
    }
}

impl Iterator for PartitionKeys {
    type Item = PartitionKey;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let id = self.next_id();
        Some(PartitionKey::new(self.prefix.clone(), id))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

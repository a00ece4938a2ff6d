//! Shared value types for the search core.
//!
//! These types carry no I/O. Metric maps are ordered so serialized output stays
//! stable across runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Named raw measurements reported by a simulation or derived by aggregation.
pub type Metrics = BTreeMap<String, f64>;

/// Fitness carried by anything that was not successfully evaluated.
pub const UNEVALUATED: f64 = f64::NEG_INFINITY;

/// Classification of one evaluation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Valid,
    /// Source could not be bound to the calling convention.
    InvalidSyntax,
    /// Candidate faulted while a trial was running.
    RuntimeFailure,
    /// Candidate exceeded the bind or per-trial deadline.
    Timeout,
}

impl EvalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EvalStatus::Valid => "valid",
            EvalStatus::InvalidSyntax => "invalid_syntax",
            EvalStatus::RuntimeFailure => "runtime_failure",
            EvalStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of scoring one candidate source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub status: EvalStatus,
    /// Aggregate fitness, or [`UNEVALUATED`] for any non-valid status.
    pub fitness: f64,
    pub metrics: Metrics,
    /// Human-readable failure cause.
    pub detail: Option<String>,
}

impl Evaluation {
    pub fn valid(fitness: f64, metrics: Metrics) -> Self {
        Self {
            status: EvalStatus::Valid,
            fitness,
            metrics,
            detail: None,
        }
    }

    pub fn failed(status: EvalStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            fitness: UNEVALUATED,
            metrics: Metrics::new(),
            detail: Some(detail.into()),
        }
    }

    /// True only for a `Valid` status carrying a finite fitness.
    pub fn is_valid(&self) -> bool {
        self.status == EvalStatus::Valid && self.fitness.is_finite()
    }
}

/// Per-status evaluation counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvalTally {
    pub valid: u64,
    pub invalid_syntax: u64,
    pub runtime_failure: u64,
    pub timeout: u64,
}

impl EvalTally {
    pub fn record(&mut self, status: EvalStatus) {
        match status {
            EvalStatus::Valid => self.valid += 1,
            EvalStatus::InvalidSyntax => self.invalid_syntax += 1,
            EvalStatus::RuntimeFailure => self.runtime_failure += 1,
            EvalStatus::Timeout => self.timeout += 1,
        }
    }

    pub fn invalid(&self) -> u64 {
        self.invalid_syntax + self.runtime_failure + self.timeout
    }

    pub fn total(&self) -> u64 {
        self.valid + self.invalid()
    }

    pub fn merge(&mut self, other: &EvalTally) {
        self.valid += other.valid;
        self.invalid_syntax += other.invalid_syntax;
        self.runtime_failure += other.runtime_failure;
        self.timeout += other.timeout;
    }
}

/// Candidate source produced by the generator, not yet registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub source: String,
    /// Generations of the parents that were shown in the prompt.
    pub parent_generations: Vec<u64>,
}

impl Proposal {
    /// A proposal with no lineage (initial seed).
    pub fn seed(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            parent_generations: Vec::new(),
        }
    }
}

/// A registered candidate program.
///
/// Constructed only by the program database. The source text and identity
/// fields are fixed at insertion; clones share the same source buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    source: Arc<str>,
    fingerprint: String,
    fitness: f64,
    metrics: Metrics,
    generation: u64,
    island_id: usize,
    parent_generations: Vec<u64>,
}

impl Candidate {
    pub(crate) fn new(
        source: Arc<str>,
        evaluation: &Evaluation,
        generation: u64,
        island_id: usize,
        parent_generations: Vec<u64>,
    ) -> Self {
        Self {
            fingerprint: fingerprint(&source),
            source,
            fitness: evaluation.fitness,
            metrics: evaluation.metrics.clone(),
            generation,
            island_id,
            parent_generations,
        }
    }

    /// Re-home a copy of `self` on another island under a fresh generation.
    pub(crate) fn transplant(&self, generation: u64, island_id: usize) -> Self {
        Self {
            source: Arc::clone(&self.source),
            fingerprint: self.fingerprint.clone(),
            fitness: self.fitness,
            metrics: self.metrics.clone(),
            generation,
            island_id,
            parent_generations: vec![self.generation],
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn fitness(&self) -> f64 {
        self.fitness
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn island_id(&self) -> usize {
        self.island_id
    }

    pub fn parent_generations(&self) -> &[u64] {
        &self.parent_generations
    }

    /// True when `self` outranks `other` for "best" purposes: higher fitness,
    /// ties resolved toward the earlier discovery.
    pub fn outranks(&self, other: &Candidate) -> bool {
        match self.fitness.total_cmp(&other.fitness) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.generation < other.generation,
        }
    }
}

/// SHA-256 of the source text, hex encoded.
pub fn fingerprint(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// Per-iteration progress summary emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRecord {
    pub iteration: u32,
    pub elapsed_seconds: f64,
    pub island_id: usize,
    pub valid_count: u64,
    pub invalid_syntax_count: u64,
    pub runtime_failure_count: u64,
    pub timeout_count: u64,
    pub accepted_count: u64,
    pub best_fitness: Option<f64>,
    pub db_size: usize,
    pub avg_fitness: Option<f64>,
    pub migrated: bool,
}

impl ProgressRecord {
    pub fn invalid_count(&self) -> u64 {
        self.invalid_syntax_count + self.runtime_failure_count + self.timeout_count
    }
}

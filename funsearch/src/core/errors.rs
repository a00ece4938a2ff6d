//! Typed errors that end or prevent a run.
//!
//! Candidate-local failures are not errors; they are [`EvalStatus`] values.
//! These types are raised through `anyhow` and recovered with `downcast_ref`.
//!
//! [`EvalStatus`]: crate::core::types::EvalStatus

use thiserror::Error;

use crate::core::types::EvalStatus;

/// Sampling touched an island that holds no candidates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("island {island_id} has no candidates (seed every island before sampling)")]
pub struct EmptyPopulation {
    pub island_id: usize,
}

/// The external generator could not produce output. Terminal for a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("generator unavailable: {reason}")]
pub struct GeneratorUnavailable {
    pub reason: String,
}

/// Failures raised by the program database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Empty(#[from] EmptyPopulation),
    #[error("island {island_id} is out of range ({islands} islands)")]
    UnknownIsland { island_id: usize, islands: usize },
    #[error("island {0} lock poisoned")]
    Poisoned(usize),
    #[error("seed evaluation is not usable ({0})")]
    InvalidSeed(EvalStatus),
}

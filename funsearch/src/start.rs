//! Seeding a fresh database before a search starts.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument};

use crate::core::database::ProgramDatabase;
use crate::core::types::{Evaluation, Proposal};
use crate::evaluate::Evaluator;

/// Read a seed program from disk.
pub fn load_seed(path: &Path) -> Result<String> {
    let source = fs::read_to_string(path).with_context(|| format!("read seed {}", path.display()))?;
    if source.trim().is_empty() {
        bail!("seed {} is empty", path.display());
    }
    Ok(source)
}

/// Evaluate `source` and place it on every island.
///
/// Refuses to start from a seed that does not score `valid`: a search needs
/// at least one viable parent per island.
#[instrument(skip_all, fields(islands = database.island_count()))]
pub fn seed_database(
    database: &ProgramDatabase,
    evaluator: &Evaluator,
    source: &str,
) -> Result<Evaluation> {
    let evaluation = evaluator.evaluate(source);
    if !evaluation.is_valid() {
        bail!(
            "seed program scored {}: {}",
            evaluation.status,
            evaluation.detail.as_deref().unwrap_or("no detail")
        );
    }
    database
        .seed_all(&Proposal::seed(source), &evaluation)
        .context("seed islands")?;
    info!(fitness = evaluation.fitness, "database seeded");
    Ok(evaluation)
}

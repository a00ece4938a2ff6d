//! One iteration of the evolutionary protocol.

use std::thread;

use anyhow::{Result, anyhow};
use rand::Rng;
use tracing::{debug, instrument};

use crate::core::database::{ProgramDatabase, Registration};
use crate::core::errors::GeneratorUnavailable;
use crate::core::types::{EvalTally, Evaluation, Proposal};
use crate::evaluate::Evaluator;
use crate::io::config::SearchConfig;
use crate::io::generator::{Generator, extract_code};
use crate::io::prompt::PromptBuilder;

/// Configuration for a single iteration.
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub samples_per_iteration: usize,
    pub parents_per_prompt: usize,
    /// Threads evaluating this iteration's candidates.
    pub eval_workers: usize,
    pub temperature: f64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            samples_per_iteration: 1,
            parents_per_prompt: 2,
            eval_workers: 1,
            temperature: 0.8,
        }
    }
}

impl StepConfig {
    pub fn from_search(config: &SearchConfig) -> Self {
        Self {
            samples_per_iteration: config.samples_per_iteration,
            parents_per_prompt: config.parents_per_prompt,
            eval_workers: config.eval_workers,
            temperature: config.generator.temperature,
        }
    }
}

/// Collaborators an iteration reads from.
pub struct StepContext<'a> {
    pub database: &'a ProgramDatabase,
    pub evaluator: &'a Evaluator,
    pub generator: &'a dyn Generator,
    pub prompts: &'a PromptBuilder,
}

/// Result of a single iteration.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    /// Island the parents were drawn from and survivors were registered on.
    pub island_id: usize,
    pub parent_generations: Vec<u64>,
    pub tally: EvalTally,
    /// Candidates that were stored (not rejected, discarded or duplicate).
    pub accepted: u64,
    pub registrations: Vec<Registration>,
    /// Best valid fitness produced this iteration.
    pub best_fitness: Option<f64>,
}

/// Draw parents, generate, evaluate, and register into the parents' island.
///
/// A generator error is returned as [`GeneratorUnavailable`]; every
/// candidate-local failure is only counted.
#[instrument(skip_all, fields(samples = config.samples_per_iteration))]
pub fn run_iteration<R: Rng + ?Sized>(
    ctx: &StepContext<'_>,
    config: &StepConfig,
    rng: &mut R,
) -> Result<IterationOutcome> {
    let parents = ctx.database.get_parents(config.parents_per_prompt, rng)?;
    let parent_generations = parents.generations();
    let request = ctx.prompts.evolve(&parents.parents, config.temperature)?;

    let mut proposals = Vec::with_capacity(config.samples_per_iteration);
    for _ in 0..config.samples_per_iteration {
        let text = ctx.generator.generate(&request).map_err(|e| GeneratorUnavailable {
            reason: format!("{e:#}"),
        })?;
        proposals.push(Proposal {
            source: extract_code(&text),
            parent_generations: parent_generations.clone(),
        });
    }

    let evaluations = evaluate_all(ctx.evaluator, &proposals, config.eval_workers)?;

    let mut outcome = IterationOutcome {
        island_id: parents.island_id,
        parent_generations,
        tally: EvalTally::default(),
        accepted: 0,
        registrations: Vec::with_capacity(proposals.len()),
        best_fitness: None,
    };
    for (proposal, evaluation) in proposals.iter().zip(&evaluations) {
        outcome.tally.record(evaluation.status);
        if evaluation.is_valid() {
            outcome.best_fitness = Some(
                outcome
                    .best_fitness
                    .map_or(evaluation.fitness, |best| best.max(evaluation.fitness)),
            );
        }
        let registration = ctx
            .database
            .register(proposal, evaluation, parents.island_id)?;
        if registration.is_stored() {
            outcome.accepted += 1;
        }
        outcome.registrations.push(registration);
    }

    debug!(
        island_id = outcome.island_id,
        valid = outcome.tally.valid,
        invalid = outcome.tally.invalid(),
        accepted = outcome.accepted,
        "iteration finished"
    );
    Ok(outcome)
}

/// Evaluate proposals, in order, on up to `workers` scoped threads.
fn evaluate_all(
    evaluator: &Evaluator,
    proposals: &[Proposal],
    workers: usize,
) -> Result<Vec<Evaluation>> {
    let workers = workers.clamp(1, proposals.len().max(1));
    if workers == 1 {
        return Ok(proposals
            .iter()
            .map(|proposal| evaluator.evaluate(&proposal.source))
            .collect());
    }

    let mut slots: Vec<Option<Evaluation>> = vec![None; proposals.len()];
    thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                scope.spawn(move || {
                    proposals
                        .iter()
                        .enumerate()
                        .skip(worker)
                        .step_by(workers)
                        .map(|(index, proposal)| (index, evaluator.evaluate(&proposal.source)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for handle in handles {
            let results = handle
                .join()
                .map_err(|_| anyhow!("evaluation worker panicked"))?;
            for (index, evaluation) in results {
                slots[index] = Some(evaluation);
            }
        }
        Ok(())
    })?;

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| slot.ok_or_else(|| anyhow!("proposal {index} was not evaluated")))
        .collect()
}

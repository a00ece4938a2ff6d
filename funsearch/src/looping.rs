//! The search loop: `Idle -> Running -> {Completed, Aborted}`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Result, bail};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::core::database::{MigrationReport, ProgramDatabase};
use crate::core::errors::GeneratorUnavailable;
use crate::core::types::{Candidate, EvalTally, ProgressRecord, Proposal};
use crate::evaluate::Evaluator;
use crate::io::config::SearchConfig;
use crate::io::generator::{Generator, extract_code};
use crate::io::prompt::PromptBuilder;
use crate::step::{IterationOutcome, StepConfig, StepContext, run_iteration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPhase {
    Idle,
    Running,
    Completed,
    Aborted,
}

impl SearchPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchPhase::Idle => "idle",
            SearchPhase::Running => "running",
            SearchPhase::Completed => "completed",
            SearchPhase::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason why `Orchestrator::run` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `max_iterations` iterations finished.
    MaxIterations,
    /// The cancel flag was set.
    Cancelled,
    /// The generator failed; the run cannot make progress.
    GeneratorUnavailable { reason: String },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxIterations => f.write_str("max iterations reached"),
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::GeneratorUnavailable { reason } => {
                write!(f, "generator unavailable: {reason}")
            }
        }
    }
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchStats {
    pub iterations: u32,
    pub evaluations: EvalTally,
    pub accepted: u64,
    pub migrations: u32,
    /// Best valid fitness seen, stored or not.
    pub best_fitness: Option<f64>,
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub phase: SearchPhase,
    pub stop: StopReason,
    pub stats: SearchStats,
    pub best: Option<Candidate>,
}

/// Shared flag that stops a run between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: u32,
    /// Migrate after every this many iterations (0 = never).
    pub migration_interval: u32,
    /// Emit an `info` line every this many iterations (0 = never).
    pub log_interval: u32,
    pub perturbation_temperature: f64,
    pub step: StepConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_search(&SearchConfig::default())
    }
}

impl LoopConfig {
    pub fn from_search(config: &SearchConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            migration_interval: config.database.migration_interval,
            log_interval: config.log_interval,
            perturbation_temperature: config.generator.perturbation_temperature,
            step: StepConfig::from_search(config),
        }
    }
}

pub struct Orchestrator {
    database: ProgramDatabase,
    evaluator: Evaluator,
    generator: Box<dyn Generator>,
    prompts: PromptBuilder,
    config: LoopConfig,
    rng: StdRng,
    phase: SearchPhase,
    stats: SearchStats,
    cancel: CancelFlag,
}

impl Orchestrator {
    /// Every island of `database` must already hold a seed.
    pub fn new(
        database: ProgramDatabase,
        evaluator: Evaluator,
        generator: Box<dyn Generator>,
        prompts: PromptBuilder,
        config: LoopConfig,
        rng_seed: u64,
    ) -> Result<Self> {
        database.ensure_seeded()?;
        let best_fitness = database.best_overall()?.map(|best| best.fitness());
        Ok(Self {
            database,
            evaluator,
            generator,
            prompts,
            config,
            rng: StdRng::seed_from_u64(rng_seed),
            phase: SearchPhase::Idle,
            stats: SearchStats {
                best_fitness,
                ..SearchStats::default()
            },
            cancel: CancelFlag::default(),
        })
    }

    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    pub fn database(&self) -> &ProgramDatabase {
        &self.database
    }

    /// Highest-fitness stored candidate.
    pub fn best_program(&self) -> Result<Option<Candidate>> {
        Ok(self.database.best_overall()?)
    }

    /// Handle for stopping the run from another thread or the progress callback.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Iterate until `max_iterations`, cancellation, or a generator failure.
    ///
    /// A generator failure ends the run as `Aborted` with an `Ok` outcome.
    /// Any other error also aborts, and is returned.
    #[instrument(skip_all, fields(max_iterations = self.config.max_iterations))]
    pub fn run<F: FnMut(&ProgressRecord)>(&mut self, mut on_progress: F) -> Result<SearchOutcome> {
        if self.phase != SearchPhase::Idle {
            bail!("search already ran (phase: {})", self.phase);
        }
        self.phase = SearchPhase::Running;
        let started = Instant::now();
        info!(islands = self.database.island_count(), "search started");

        let stop = loop {
            if self.stats.iterations >= self.config.max_iterations {
                break StopReason::MaxIterations;
            }
            if self.cancel.is_cancelled() {
                info!(iterations = self.stats.iterations, "search cancelled");
                break StopReason::Cancelled;
            }

            let iteration = self.stats.iterations + 1;
            let outcome = match self.iterate() {
                Ok(outcome) => outcome,
                Err(err) => match generator_unavailable(&err) {
                    Some(stop) => {
                        error!(iteration, %stop, "search stopped");
                        break stop;
                    }
                    None => {
                        self.phase = SearchPhase::Aborted;
                        return Err(err.context(format!("iteration {iteration}")));
                    }
                },
            };

            // A failed migration still reports the iteration it followed.
            let mut halted = None;
            let mut migrated = false;
            if self.config.migration_interval > 0 && iteration % self.config.migration_interval == 0
            {
                match self.migrate() {
                    Ok(report) => {
                        self.stats.migrations += 1;
                        migrated = true;
                        debug!(iteration, reset = ?report.reset, "migration finished");
                    }
                    Err(err) => match generator_unavailable(&err) {
                        Some(stop) => {
                            error!(iteration, %stop, "search stopped during migration");
                            halted = Some(stop);
                        }
                        None => {
                            self.phase = SearchPhase::Aborted;
                            return Err(err.context(format!("migration after iteration {iteration}")));
                        }
                    },
                }
            }

            let record = match self.progress(iteration, started, &outcome, migrated) {
                Ok(record) => record,
                Err(err) => {
                    self.phase = SearchPhase::Aborted;
                    return Err(err);
                }
            };
            if self.config.log_interval > 0 && iteration % self.config.log_interval == 0 {
                info!(
                    iteration,
                    best_fitness = ?record.best_fitness,
                    db_size = record.db_size,
                    valid = self.stats.evaluations.valid,
                    invalid = self.stats.evaluations.invalid(),
                    accepted = self.stats.accepted,
                    "progress"
                );
            }
            on_progress(&record);
            if let Some(stop) = halted {
                break stop;
            }
        };

        self.phase = match stop {
            StopReason::MaxIterations => SearchPhase::Completed,
            StopReason::Cancelled | StopReason::GeneratorUnavailable { .. } => {
                SearchPhase::Aborted
            }
        };
        let best = self.best_program()?;
        info!(
            phase = %self.phase,
            stop = %stop,
            iterations = self.stats.iterations,
            best_fitness = ?best.as_ref().map(Candidate::fitness),
            "search finished"
        );
        Ok(SearchOutcome {
            phase: self.phase,
            stop,
            stats: self.stats.clone(),
            best,
        })
    }

    fn iterate(&mut self) -> Result<IterationOutcome> {
        let ctx = StepContext {
            database: &self.database,
            evaluator: &self.evaluator,
            generator: self.generator.as_ref(),
            prompts: &self.prompts,
        };
        let outcome = run_iteration(&ctx, &self.config.step, &mut self.rng)?;

        self.stats.iterations += 1;
        self.stats.evaluations.merge(&outcome.tally);
        self.stats.accepted += outcome.accepted;
        if let Some(fitness) = outcome.best_fitness {
            self.stats.best_fitness = Some(
                self.stats
                    .best_fitness
                    .map_or(fitness, |best| best.max(fitness)),
            );
        }
        Ok(outcome)
    }

    /// Reset the weakest islands, reseeding each from a perturbed champion.
    fn migrate(&self) -> Result<MigrationReport> {
        let temperature = self.config.perturbation_temperature;
        self.database.migrate(|champion, island_id| {
            let request = self.prompts.perturb(champion, island_id, temperature)?;
            let text = self
                .generator
                .generate(&request)
                .map_err(|e| GeneratorUnavailable {
                    reason: format!("{e:#}"),
                })?;
            let source = extract_code(&text);
            let evaluation = self.evaluator.evaluate(&source);
            if !evaluation.is_valid() {
                warn!(
                    island_id,
                    status = %evaluation.status,
                    "perturbed champion invalid, copying champion"
                );
                return Ok(None);
            }
            Ok(Some((
                Proposal {
                    source,
                    parent_generations: vec![champion.generation()],
                },
                evaluation,
            )))
        })
    }

    fn progress(
        &self,
        iteration: u32,
        started: Instant,
        outcome: &IterationOutcome,
        migrated: bool,
    ) -> Result<ProgressRecord> {
        let stats = self.database.stats()?;
        Ok(ProgressRecord {
            iteration,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            island_id: outcome.island_id,
            valid_count: outcome.tally.valid,
            invalid_syntax_count: outcome.tally.invalid_syntax,
            runtime_failure_count: outcome.tally.runtime_failure,
            timeout_count: outcome.tally.timeout,
            accepted_count: outcome.accepted,
            best_fitness: stats.best_fitness,
            db_size: stats.size,
            avg_fitness: stats.avg_fitness,
            migrated,
        })
    }
}

fn generator_unavailable(err: &anyhow::Error) -> Option<StopReason> {
    err.downcast_ref::<GeneratorUnavailable>()
        .map(|unavailable| StopReason::GeneratorUnavailable {
            reason: unavailable.reason.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::database::DatabaseConfig;
    use crate::core::errors::{DatabaseError, EmptyPopulation};
    use crate::core::sampling::SamplingPolicy;
    use crate::start::seed_database;
    use crate::test_support::{ScriptedGenerator, scripted_evaluator};

    fn fenced(source: &str) -> Result<String, String> {
        Ok(format!("```python\n{source}\n```"))
    }

    fn orchestrator(
        islands: usize,
        generator: ScriptedGenerator,
        config: LoopConfig,
    ) -> Orchestrator {
        let evaluator = scripted_evaluator(2, 1_000);
        let database = ProgramDatabase::new(
            DatabaseConfig {
                islands,
                island_capacity: 10,
                ..DatabaseConfig::default()
            },
            SamplingPolicy::default(),
        );
        seed_database(&database, &evaluator, "stay").expect("seed");
        let prompts = PromptBuilder::new("mice_behavior", 2).expect("prompts");
        Orchestrator::new(database, evaluator, Box::new(generator), prompts, config, 7)
            .expect("orchestrator")
    }

    fn config(max_iterations: u32, migration_interval: u32) -> LoopConfig {
        LoopConfig {
            max_iterations,
            migration_interval,
            log_interval: 1,
            ..LoopConfig::default()
        }
    }

    #[test]
    fn runs_to_completion_and_improves_on_seed() {
        let responses = (0..6).map(|i| fenced(&format!("flee # {i}"))).collect();
        let mut search = orchestrator(2, ScriptedGenerator::new(responses), config(6, 0));
        let seed_fitness = search.stats().best_fitness.expect("seed fitness");
        assert_eq!(search.phase(), SearchPhase::Idle);

        let mut records = Vec::new();
        let outcome = search.run(|record| records.push(record.clone())).expect("run");

        assert_eq!(outcome.phase, SearchPhase::Completed);
        assert_eq!(outcome.stop, StopReason::MaxIterations);
        assert_eq!(outcome.stats.iterations, 6);
        assert_eq!(outcome.stats.evaluations.valid, 6);
        assert_eq!(outcome.stats.accepted, 6);
        assert_eq!(records.len(), 6);
        assert_eq!(records[5].iteration, 6);
        assert_eq!(records[5].db_size, 8);
        let best = outcome.best.expect("best");
        assert!(best.fitness() >= seed_fitness);
        assert_eq!(outcome.stats.best_fitness, Some(best.fitness()));
        assert_eq!(search.phase(), SearchPhase::Completed);
    }

    #[test]
    fn second_run_is_rejected() {
        let generator = ScriptedGenerator::default().with_fallback("```python\nchase\n```");
        let mut search = orchestrator(1, generator, config(1, 0));
        search.run(|_| {}).expect("first run");
        let err = search.run(|_| {}).unwrap_err();
        assert!(err.to_string().contains("already ran"), "{err}");
    }

    #[test]
    fn generator_failure_aborts_with_reason() {
        let generator = ScriptedGenerator::new(vec![
            fenced("flee # 1"),
            Err("connection refused".to_string()),
        ]);
        let mut search = orchestrator(1, generator, config(10, 0));

        let outcome = search.run(|_| {}).expect("run");

        assert_eq!(outcome.phase, SearchPhase::Aborted);
        match &outcome.stop {
            StopReason::GeneratorUnavailable { reason } => {
                assert!(reason.contains("connection refused"), "{reason}");
            }
            other => panic!("unexpected stop: {other:?}"),
        }
        assert_eq!(outcome.stats.iterations, 1);
        assert!(outcome.best.is_some());
    }

    #[test]
    fn generator_failure_during_migration_aborts_after_reporting() {
        let generator = ScriptedGenerator::new(vec![
            fenced("flee # 1"),
            Err("quota exceeded".to_string()),
        ]);
        let mut search = orchestrator(2, generator, config(10, 1));

        let mut records = Vec::new();
        let outcome = search.run(|record| records.push(record.clone())).expect("run");

        assert_eq!(outcome.phase, SearchPhase::Aborted);
        match &outcome.stop {
            StopReason::GeneratorUnavailable { reason } => {
                assert!(reason.contains("quota exceeded"), "{reason}");
            }
            other => panic!("unexpected stop: {other:?}"),
        }
        assert_eq!(outcome.stats.iterations, 1);
        assert_eq!(outcome.stats.migrations, 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].iteration, 1);
        assert!(!records[0].migrated);
        search.database().ensure_seeded().expect("every island keeps a program");
    }

    #[test]
    fn invalid_candidates_are_counted_not_fatal() {
        let generator = ScriptedGenerator::new(vec![
            fenced("divide"),
            fenced("fault"),
            fenced("not a program"),
        ]);
        let mut search = orchestrator(1, generator, config(3, 0));

        let outcome = search.run(|_| {}).expect("run");

        assert_eq!(outcome.phase, SearchPhase::Completed);
        assert_eq!(outcome.stats.evaluations.runtime_failure, 2);
        assert_eq!(outcome.stats.evaluations.invalid_syntax, 1);
        assert_eq!(outcome.stats.accepted, 0);
        assert_eq!(search.database().rejected(), 3);
        assert_eq!(
            outcome.best.expect("seed").source(),
            "stay",
            "only the seed survives"
        );
    }

    #[test]
    fn cancellation_stops_between_iterations() {
        let generator = ScriptedGenerator::default().with_fallback("```python\nchase\n```");
        let mut search = orchestrator(1, generator, config(50, 0));
        let cancel = search.cancel_flag();

        let outcome = search
            .run(|record| {
                if record.iteration == 3 {
                    cancel.cancel();
                }
            })
            .expect("run");

        assert_eq!(outcome.phase, SearchPhase::Aborted);
        assert_eq!(outcome.stop, StopReason::Cancelled);
        assert_eq!(outcome.stats.iterations, 3);
    }

    #[test]
    fn migration_runs_on_schedule() {
        let generator = ScriptedGenerator::default().with_fallback("```python\nnope\n```");
        let mut search = orchestrator(4, generator, config(4, 2));

        let mut migrated = Vec::new();
        let outcome = search
            .run(|record| migrated.push(record.migrated))
            .expect("run");

        assert_eq!(migrated, vec![false, true, false, true]);
        assert_eq!(outcome.stats.migrations, 2);
        // Invalid perturbations fall back to champion copies; every island stays seeded.
        search.database().ensure_seeded().expect("seeded");
    }

    #[test]
    fn unseeded_database_is_rejected() {
        let evaluator = scripted_evaluator(1, 1_000);
        let database = ProgramDatabase::new(DatabaseConfig::default(), SamplingPolicy::default());
        let prompts = PromptBuilder::new("mice_behavior", 1).expect("prompts");
        let err = Orchestrator::new(
            database,
            evaluator,
            Box::new(ScriptedGenerator::default()),
            prompts,
            LoopConfig::default(),
            0,
        )
        .err()
        .expect("unseeded");
        assert_eq!(
            err.downcast_ref::<DatabaseError>(),
            Some(&DatabaseError::Empty(EmptyPopulation { island_id: 0 }))
        );
    }
}

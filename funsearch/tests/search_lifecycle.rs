//! End-to-end search tests over scripted collaborators.
//!
//! These drive `Orchestrator::run` with `ScriptedGenerator` and the scripted
//! sandbox, then check the database-wide guarantees that must hold after any
//! run: bounded islands, no failed candidate stored, unique generations, and a
//! champion that survives migration.

use std::collections::HashSet;

use funsearch::core::database::{DatabaseConfig, IslandSelection, ProgramDatabase};
use funsearch::core::sampling::SamplingPolicy;
use funsearch::core::types::{Candidate, UNEVALUATED};
use funsearch::io::prompt::PromptBuilder;
use funsearch::looping::{LoopConfig, Orchestrator, SearchPhase, StopReason};
use funsearch::start::seed_database;
use funsearch::step::StepConfig;
use funsearch::test_support::{ScriptedGenerator, scripted_evaluator};

const CAPACITY: usize = 4;

/// Cycle through good, bad, and broken behaviors; tags keep sources distinct.
fn mixed_responses(count: usize) -> Vec<Result<String, String>> {
    let behaviors = ["flee", "chase", "divide", "stay", "syntax error", "fault"];
    (0..count)
        .map(|i| {
            let behavior = behaviors[i % behaviors.len()];
            Ok(format!("```python\n{behavior} # {i}\n```"))
        })
        .collect()
}

fn build(
    islands: usize,
    responses: Vec<Result<String, String>>,
    config: LoopConfig,
) -> Orchestrator {
    let evaluator = scripted_evaluator(2, 1_000);
    let database = ProgramDatabase::new(
        DatabaseConfig {
            islands,
            island_capacity: CAPACITY,
            island_selection: IslandSelection::RoundRobin,
            ..DatabaseConfig::default()
        },
        SamplingPolicy::default(),
    );
    seed_database(&database, &evaluator, "chase").expect("seed");
    let prompts = PromptBuilder::new("mice_behavior", 2).expect("prompts");
    let generator = ScriptedGenerator::new(responses).with_fallback("```python\nstay\n```");
    Orchestrator::new(database, evaluator, Box::new(generator), prompts, config, 11)
        .expect("orchestrator")
}

fn all_members(search: &Orchestrator) -> Vec<Candidate> {
    (0..search.database().island_count())
        .flat_map(|id| search.database().island_members(id).expect("members"))
        .collect()
}

#[test]
fn long_run_keeps_database_invariants() {
    let config = LoopConfig {
        max_iterations: 40,
        migration_interval: 5,
        log_interval: 0,
        step: StepConfig {
            samples_per_iteration: 3,
            parents_per_prompt: 2,
            eval_workers: 2,
            temperature: 0.8,
        },
        ..LoopConfig::default()
    };
    let mut search = build(3, mixed_responses(120), config);

    let mut best_seen = f64::NEG_INFINITY;
    let mut records = 0;
    let outcome = search
        .run(|record| {
            records += 1;
            let best = record.best_fitness.expect("seeded database has a best");
            assert!(best >= best_seen, "best fitness regressed");
            best_seen = best;
            assert!(record.db_size <= 3 * CAPACITY);
        })
        .expect("run");

    assert_eq!(outcome.phase, SearchPhase::Completed);
    assert_eq!(outcome.stop, StopReason::MaxIterations);
    assert_eq!(records, 40);
    assert_eq!(outcome.stats.evaluations.total(), 120);
    assert_eq!(outcome.stats.migrations, 8);
    assert!(outcome.stats.evaluations.runtime_failure > 0);
    assert!(outcome.stats.evaluations.invalid_syntax > 0);
    assert!(outcome.stats.accepted > 0);

    let members = all_members(&search);
    for island_id in 0..3 {
        let island = search.database().island_members(island_id).expect("members");
        assert!(!island.is_empty());
        assert!(island.len() <= CAPACITY);
    }
    assert!(members.iter().all(|m| m.fitness() != UNEVALUATED));
    assert!(members.iter().all(|m| m.fitness().is_finite()));

    let generations: HashSet<u64> = members.iter().map(Candidate::generation).collect();
    assert_eq!(generations.len(), members.len(), "generations are unique");

    let best = outcome.best.expect("best");
    assert_eq!(
        Some(best.fitness()),
        members.iter().map(Candidate::fitness).reduce(f64::max)
    );
}

#[test]
fn generator_outage_mid_run_aborts_and_keeps_progress() {
    let mut responses = mixed_responses(4);
    responses.push(Err("503 service unavailable".to_string()));
    let config = LoopConfig {
        max_iterations: 100,
        migration_interval: 0,
        log_interval: 0,
        step: StepConfig {
            samples_per_iteration: 1,
            ..StepConfig::default()
        },
        ..LoopConfig::default()
    };
    let mut search = build(2, responses, config);

    let outcome = search.run(|_| {}).expect("run");

    assert_eq!(outcome.phase, SearchPhase::Aborted);
    assert!(matches!(
        &outcome.stop,
        StopReason::GeneratorUnavailable { reason } if reason.contains("503")
    ));
    assert_eq!(outcome.stats.iterations, 4);
    assert_eq!(outcome.stats.evaluations.total(), 4);
    assert!(search.best_program().expect("best").is_some());
    assert!(search.run(|_| {}).is_err(), "a finished search cannot run again");
}

#[test]
fn cancel_from_another_thread_stops_the_run() {
    let config = LoopConfig {
        max_iterations: u32::MAX,
        migration_interval: 0,
        log_interval: 0,
        ..LoopConfig::default()
    };
    let mut search = build(1, Vec::new(), config);
    let cancel = search.cancel_flag();

    let outcome = std::thread::scope(|scope| {
        let run = scope.spawn(|| search.run(|_| {}));
        std::thread::sleep(std::time::Duration::from_millis(50));
        cancel.cancel();
        run.join().expect("run thread")
    })
    .expect("run");

    assert_eq!(outcome.phase, SearchPhase::Aborted);
    assert_eq!(outcome.stop, StopReason::Cancelled);
    assert!(outcome.stats.iterations > 0);
}

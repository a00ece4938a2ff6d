//! Evolutionary program search.
//!
//! Evolves `mice_behavior` policies for a predator-prey arena: a generator
//! proposes programs from the best stored ones, the evaluator scores them over
//! seeded trials, and an island-model database keeps the fittest.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use clap::{Parser, Subcommand};

use funsearch::core::database::ProgramDatabase;
use funsearch::evaluate::Evaluator;
use funsearch::exit_codes;
use funsearch::io::config::{CONFIG_FILE, load_config};
use funsearch::io::generator::build_generator;
use funsearch::io::init::{InitOptions, SEED_FILE, init_project};
use funsearch::io::prompt::PromptBuilder;
use funsearch::io::run_log::{
    DEFAULT_OUT_DIR, ProgressLog, RunPaths, RunReport, run_id, write_report,
};
use funsearch::logging;
use funsearch::looping::{LoopConfig, Orchestrator, SearchPhase, SearchStats};
use funsearch::start::{load_seed, seed_database};

#[derive(Parser)]
#[command(
    name = "funsearch",
    version,
    about = "Evolutionary search over generated programs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `funsearch.toml` and `seed.py` into the current directory.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Seed the database and run the search loop.
    Run {
        #[arg(long, default_value = CONFIG_FILE)]
        config: PathBuf,
        /// Seed program.
        #[arg(long, default_value = SEED_FILE)]
        seed: PathBuf,
        /// Directory that receives the run directory.
        #[arg(long, default_value = DEFAULT_OUT_DIR)]
        out: PathBuf,
        /// Override `max_iterations`.
        #[arg(long)]
        iterations: Option<u32>,
    },
    /// Score one program and print the evaluation as JSON.
    Evaluate {
        file: PathBuf,
        #[arg(long, default_value = CONFIG_FILE)]
        config: PathBuf,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Run {
            config,
            seed,
            out,
            iterations,
        } => cmd_run(&config, &seed, &out, iterations),
        Command::Evaluate { file, config } => cmd_evaluate(&file, &config),
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let paths = init_project(Path::new("."), &InitOptions { force })?;
    println!(
        "wrote {} and {}",
        paths.config_path.display(),
        paths.seed_path.display()
    );
    Ok(exit_codes::OK)
}

fn cmd_run(
    config_path: &Path,
    seed_path: &Path,
    out: &Path,
    iterations: Option<u32>,
) -> Result<i32> {
    let mut config = load_config(config_path)?;
    if let Some(iterations) = iterations {
        config.max_iterations = iterations;
    }
    let source = load_seed(seed_path)?;

    let evaluator = Evaluator::from_config(&config)?;
    let database = ProgramDatabase::new(config.database.clone(), config.sampling);
    let seed = seed_database(&database, &evaluator, &source)?;
    println!("seed fitness {:.3}", seed.fitness);

    let generator = build_generator(&config.generator, config.rng_seed)?;
    let prompts = PromptBuilder::new(&config.sandbox.entry_point, config.evaluation.trials)?;
    let mut search = Orchestrator::new(
        database,
        evaluator,
        generator,
        prompts,
        LoopConfig::from_search(&config),
        config.rng_seed,
    )?;

    let started = Local::now();
    let paths = RunPaths::create_unique(out, &run_id(&started), &config)?;
    let mut progress = ProgressLog::open(&paths.progress_path)?;

    let cancel = search.cancel_flag();
    let mut log_error = None;
    let result = search.run(|record| {
        println!(
            "iter {:>4}  island {}  valid {}  invalid {}  accepted {}  best {}  db {}",
            record.iteration,
            record.island_id,
            record.valid_count,
            record.invalid_count(),
            record.accepted_count,
            record
                .best_fitness
                .map_or_else(|| "-".to_string(), |f| format!("{f:.3}")),
            record.db_size,
        );
        if log_error.is_none()
            && let Err(err) = progress.append(record)
        {
            log_error = Some(err);
            cancel.cancel();
        }
    });
    if let Some(err) = log_error {
        return Err(err);
    }

    let stats = search.database().stats()?;
    let best = search.best_program()?;
    let (phase, stop_reason, counters, outcome) = match result {
        Ok(outcome) => (
            outcome.phase,
            Some(outcome.stop.to_string()),
            outcome.stats.clone(),
            Ok(outcome),
        ),
        Err(err) => (
            search.phase(),
            Some(format!("{err:#}")),
            search.stats().clone(),
            Err(err),
        ),
    };
    let report = RunReport {
        run_id: &paths.run_id,
        started_at: started.to_rfc3339_opts(SecondsFormat::Secs, true),
        ended_at: Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        phase: phase.as_str(),
        stop_reason,
        iterations: counters.iterations,
        evaluations: counters.evaluations,
        accepted: counters.accepted,
        migrations: counters.migrations,
        best: best.as_ref(),
        database: &stats,
    };
    write_report(&paths, &report)?;

    let outcome = outcome?;
    print_summary(&outcome.stats, best.as_ref().map(|b| b.fitness()), &paths);
    println!("{}: {}", outcome.phase, outcome.stop);
    Ok(match outcome.phase {
        SearchPhase::Completed => exit_codes::OK,
        _ => exit_codes::ABORTED,
    })
}

fn print_summary(stats: &SearchStats, best: Option<f64>, paths: &RunPaths) {
    let tally = &stats.evaluations;
    println!(
        "evaluated {} (valid {}, invalid_syntax {}, runtime_failure {}, timeout {}), accepted {}",
        tally.total(),
        tally.valid,
        tally.invalid_syntax,
        tally.runtime_failure,
        tally.timeout,
        stats.accepted,
    );
    if let Some(best) = best {
        println!("best fitness {best:.3} -> {}", paths.best_path.display());
    }
    println!("report {}", paths.report_path.display());
}

fn cmd_evaluate(file: &Path, config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let source =
        fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let evaluator = Evaluator::from_config(&config)?;
    let evaluation = evaluator.evaluate(&source);
    let json = serde_json::to_string_pretty(&evaluation).context("serialize evaluation")?;
    println!("{json}");
    Ok(if evaluation.is_valid() {
        exit_codes::OK
    } else {
        exit_codes::REJECTED
    })
}

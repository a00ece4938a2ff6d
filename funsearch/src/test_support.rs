//! Test doubles and fixtures shared by unit and integration tests.
//!
//! [`ScriptedSandbox`] binds candidate "sources" by keyword to in-process
//! policies, so evaluation and search tests need no interpreter. The keyword
//! is the text before the first `#`; anything after it only makes sources
//! distinct (`"flee # 3"` and `"flee # 4"` behave the same but do not dedup).

use std::collections::VecDeque;
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::fitness::FitnessWeights;
use crate::core::policy::{KillSwitch, Move, Observation, Policy, PolicyFault};
use crate::core::simulation::{PredatorPrey, SimulationConfig};
use crate::core::types::{Candidate, Evaluation, Metrics};
use crate::evaluate::Evaluator;
use crate::io::config::EvaluationConfig;
use crate::io::generator::{GenerateRequest, Generator};
use crate::io::sandbox::{BindError, Sandbox};

/// A stored-looking candidate with a source unique to `(generation, island_id)`.
pub fn candidate(fitness: f64, generation: u64, island_id: usize) -> Candidate {
    candidate_with_source(
        &format!("candidate {generation} on {island_id}"),
        fitness,
        generation,
        island_id,
    )
}

pub fn candidate_with_source(
    source: &str,
    fitness: f64,
    generation: u64,
    island_id: usize,
) -> Candidate {
    Candidate::new(
        Arc::from(source),
        &valid_evaluation(fitness),
        generation,
        island_id,
        Vec::new(),
    )
}

pub fn valid_evaluation(fitness: f64) -> Evaluation {
    Evaluation::valid(fitness, Metrics::new())
}

/// Policy keyword of a scripted source.
pub fn keyword(source: &str) -> &str {
    source.split('#').next().unwrap_or_default().trim()
}

/// Sandbox that maps source keywords to in-process policies:
///
/// - `flee`: run directly away from the predator
/// - `chase`: run toward the predator
/// - `stay`: never move
/// - `divide`: integer division by zero (panics)
/// - `fault`: raise on the first call
/// - `hang`: block until the kill switch fires
///
/// Any other source fails to bind.
#[derive(Debug, Default)]
pub struct ScriptedSandbox;

impl Sandbox for ScriptedSandbox {
    fn bind(&self, source: &str) -> Result<Box<dyn Policy>, BindError> {
        let policy: Box<dyn Policy> = match keyword(source) {
            "flee" => Box::new(Heading(1.0)),
            "chase" => Box::new(Heading(-1.0)),
            "stay" => Box::new(Heading(0.0)),
            "divide" => Box::new(Divide),
            "fault" => Box::new(Fault),
            "hang" => Box::new(Hang::default()),
            other => {
                return Err(BindError::Invalid(format!(
                    "unknown scripted behavior {other:?}"
                )));
            }
        };
        Ok(policy)
    }
}

struct Heading(f64);

impl Policy for Heading {
    fn act(&mut self, observation: &Observation) -> Result<Move, PolicyFault> {
        Ok(Move {
            dx: self.0 * (observation.mouse[0] - observation.predator[0]),
            dy: self.0 * (observation.mouse[1] - observation.predator[1]),
        })
    }
}

struct Divide;

impl Policy for Divide {
    fn act(&mut self, observation: &Observation) -> Result<Move, PolicyFault> {
        let zero = black_box(0i64);
        let dx = i64::from(observation.state.step) / zero;
        Ok(Move {
            dx: dx as f64,
            dy: 0.0,
        })
    }
}

struct Fault;

impl Policy for Fault {
    fn act(&mut self, _observation: &Observation) -> Result<Move, PolicyFault> {
        Err(PolicyFault::new("ValueError: scripted fault"))
    }
}

#[derive(Default)]
struct Hang {
    killed: Arc<AtomicBool>,
}

impl Policy for Hang {
    fn act(&mut self, _observation: &Observation) -> Result<Move, PolicyFault> {
        while !self.killed.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        Err(PolicyFault::new("killed"))
    }

    fn kill_switch(&self) -> Option<KillSwitch> {
        let killed = Arc::clone(&self.killed);
        Some(Box::new(move || killed.store(true, Ordering::SeqCst)))
    }
}

/// Small, fast evaluation settings for tests.
pub fn evaluation_config(trials: u32, trial_timeout_ms: u64) -> EvaluationConfig {
    EvaluationConfig {
        trials,
        trial_timeout_ms,
        bind_timeout_ms: 1_000,
        base_seed: 0,
        weights: FitnessWeights::default(),
    }
}

/// Evaluator over [`ScriptedSandbox`] and a small predator-prey arena.
pub fn scripted_evaluator(trials: u32, trial_timeout_ms: u64) -> Evaluator {
    Evaluator::new(
        Box::new(ScriptedSandbox),
        Arc::new(PredatorPrey::new(SimulationConfig {
            max_steps: 60,
            ..SimulationConfig::default()
        })),
        evaluation_config(trials, trial_timeout_ms),
    )
}

/// Generator that replays queued responses and records every request.
///
/// `Err` entries simulate an unavailable backend. Once the queue is empty,
/// `fallback` is returned if set; otherwise the call fails.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// Always answer with `text` once the queue is drained.
    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = Some(text.to_string());
        self
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests lock poisoned"))?
            .push(request.clone());
        let next = self
            .responses
            .lock()
            .map_err(|_| anyhow!("responses lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| anyhow!("scripted generator exhausted")),
        }
    }
}

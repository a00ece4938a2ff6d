//! Scoring candidate source: bind, run seeded trials under a deadline, aggregate.
//!
//! Every candidate-local failure becomes an [`EvalStatus`]; `evaluate` never
//! returns an error. Each trial binds a fresh policy and runs on its own
//! thread; the evaluator waits on a channel with a hard deadline, so a
//! candidate that never returns cannot stall the search.

use std::any::Any;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;

use anyhow::Result;
use tracing::{debug, error, instrument, warn};

use crate::core::fitness::aggregate;
use crate::core::simulation::{PredatorPrey, Simulation, TrialSpec};
use crate::core::types::{EvalStatus, Evaluation, Metrics};
use crate::io::config::{EvaluationConfig, SearchConfig};
use crate::io::sandbox::{BindError, ProcessSandbox, Sandbox};

pub struct Evaluator {
    sandbox: Box<dyn Sandbox>,
    simulation: Arc<dyn Simulation>,
    config: EvaluationConfig,
}

impl Evaluator {
    pub fn new(
        sandbox: Box<dyn Sandbox>,
        simulation: Arc<dyn Simulation>,
        config: EvaluationConfig,
    ) -> Self {
        Self {
            sandbox,
            simulation,
            config,
        }
    }

    /// Process sandbox plus predator-prey simulation, as configured.
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let sandbox = ProcessSandbox::new(config.sandbox.clone(), config.evaluation.bind_timeout())?;
        Ok(Self::new(
            Box::new(sandbox),
            Arc::new(PredatorPrey::new(config.simulation.clone())),
            config.evaluation.clone(),
        ))
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Score `source`. The first failing trial ends the evaluation.
    #[instrument(skip_all, fields(bytes = source.len(), trials = self.config.trials))]
    pub fn evaluate(&self, source: &str) -> Evaluation {
        let mut trials: Vec<Metrics> = Vec::with_capacity(self.config.trials as usize);
        for index in 0..self.config.trials {
            let trial = TrialSpec {
                index,
                seed: self.config.base_seed.wrapping_add(u64::from(index)),
            };
            match self.run_trial(source, trial) {
                Ok(metrics) => trials.push(metrics),
                Err(failed) => {
                    debug!(
                        trial = index,
                        status = %failed.status,
                        detail = failed.detail.as_deref().unwrap_or_default(),
                        "evaluation failed"
                    );
                    return failed;
                }
            }
        }

        match aggregate(&trials, &self.config.weights) {
            Ok((fitness, metrics)) => {
                debug!(fitness, "evaluation valid");
                Evaluation::valid(fitness, metrics)
            }
            Err(e) => Evaluation::failed(EvalStatus::RuntimeFailure, e.to_string()),
        }
    }

    fn run_trial(&self, source: &str, trial: TrialSpec) -> Result<Metrics, Evaluation> {
        let mut policy = self.sandbox.bind(source).map_err(|e| {
            if let BindError::Unavailable(cause) = &e {
                error!(err = %format!("{cause:#}"), "sandbox unavailable");
            }
            Evaluation::failed(e.status(), e.to_string())
        })?;
        let kill = policy.kill_switch();
        let simulation = Arc::clone(&self.simulation);

        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("trial-{}", trial.index))
            .spawn(move || {
                let result = simulation.run_trial(policy.as_mut(), &trial);
                let _ = tx.send(result);
            })
            .map_err(|e| {
                Evaluation::failed(
                    EvalStatus::RuntimeFailure,
                    format!("spawn trial thread: {e}"),
                )
            })?;

        let timeout = self.config.trial_timeout();
        match rx.recv_timeout(timeout) {
            Ok(Ok(metrics)) => {
                let _ = handle.join();
                Ok(metrics)
            }
            Ok(Err(fault)) => Err(Evaluation::failed(EvalStatus::RuntimeFailure, fault.0)),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    trial = trial.index,
                    timeout_ms = timeout.as_millis() as u64,
                    "trial timed out, killing"
                );
                if let Some(kill) = kill {
                    kill();
                }
                Err(Evaluation::failed(
                    EvalStatus::Timeout,
                    format!("trial {} exceeded {}ms", trial.index, timeout.as_millis()),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let detail = match handle.join() {
                    Err(payload) => panic_message(payload.as_ref()),
                    Ok(()) => "trial ended without a result".to_string(),
                };
                Err(Evaluation::failed(EvalStatus::RuntimeFailure, detail))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::core::fitness::{FitnessWeights, TRIAL_MAX_METRIC, TRIAL_MIN_METRIC, TRIALS_METRIC};
    use crate::core::types::UNEVALUATED;
    use crate::test_support::{ScriptedSandbox, evaluation_config, scripted_evaluator};

    #[test]
    fn valid_candidate_gets_finite_fitness_and_trial_metrics() {
        let evaluator = scripted_evaluator(4, 2_000);
        let evaluation = evaluator.evaluate("flee");

        assert_eq!(evaluation.status, EvalStatus::Valid);
        assert!(evaluation.fitness.is_finite());
        assert_eq!(evaluation.metrics[TRIALS_METRIC], 4.0);
        assert!(evaluation.metrics[TRIAL_MIN_METRIC] <= evaluation.fitness);
        assert!(evaluation.metrics[TRIAL_MAX_METRIC] >= evaluation.fitness);
        assert!(evaluation.metrics.contains_key("survival_rate"));
    }

    #[test]
    fn scoring_is_deterministic() {
        let evaluator = scripted_evaluator(3, 2_000);
        let first = evaluator.evaluate("flee");
        let second = evaluator.evaluate("flee # again");
        assert_eq!(first.fitness, second.fitness);
        assert_eq!(first.metrics, second.metrics);
    }

    #[test]
    fn fitness_is_weighted_sum_of_metric_means() {
        let evaluator = scripted_evaluator(3, 2_000);
        let evaluation = evaluator.evaluate("stay");
        let expected: f64 = FitnessWeights::default()
            .iter()
            .map(|(name, weight)| weight * evaluation.metrics[name])
            .sum();
        assert!((evaluation.fitness - expected).abs() < 1e-9);
    }

    #[test]
    fn divide_by_zero_is_runtime_failure() {
        let evaluation = scripted_evaluator(2, 2_000).evaluate("divide");
        assert_eq!(evaluation.status, EvalStatus::RuntimeFailure);
        assert_eq!(evaluation.fitness, UNEVALUATED);
        assert!(
            evaluation
                .detail
                .as_deref()
                .is_some_and(|detail| detail.contains("divide by zero")),
            "{:?}",
            evaluation.detail
        );
    }

    #[test]
    fn raised_fault_is_runtime_failure() {
        let evaluation = scripted_evaluator(2, 2_000).evaluate("fault");
        assert_eq!(evaluation.status, EvalStatus::RuntimeFailure);
        assert_eq!(evaluation.detail.as_deref(), Some("ValueError: scripted fault"));
    }

    #[test]
    fn unbindable_source_is_invalid_syntax() {
        let evaluation = scripted_evaluator(2, 2_000).evaluate("def (");
        assert_eq!(evaluation.status, EvalStatus::InvalidSyntax);
        assert!(!evaluation.is_valid());
    }

    #[test]
    fn looping_candidate_times_out_promptly() {
        let evaluator = scripted_evaluator(5, 200);
        let started = Instant::now();
        let evaluation = evaluator.evaluate("hang");
        assert_eq!(evaluation.status, EvalStatus::Timeout);
        assert_eq!(evaluation.fitness, UNEVALUATED);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn unknown_weight_metric_is_runtime_failure() {
        let mut config = evaluation_config(2, 2_000);
        config.weights = FitnessWeights::new([("speed", 1.0)]);
        let evaluator = Evaluator::new(
            Box::new(ScriptedSandbox),
            Arc::new(PredatorPrey::default()),
            config,
        );
        let evaluation = evaluator.evaluate("flee");
        assert_eq!(evaluation.status, EvalStatus::RuntimeFailure);
        assert!(evaluation.detail.as_deref().is_some_and(|d| d.contains("speed")));
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "panicked: boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "panicked: bang");
    }
}

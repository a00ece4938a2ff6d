//! Deterministic fitness aggregation over independent trials.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::Metrics;

/// Metric key holding the number of aggregated trials.
pub const TRIALS_METRIC: &str = "trials";
/// Metric key holding the weakest per-trial score.
pub const TRIAL_MIN_METRIC: &str = "trial_fitness_min";
/// Metric key holding the strongest per-trial score.
pub const TRIAL_MAX_METRIC: &str = "trial_fitness_max";

/// Explicit linear combination of per-trial metrics.
///
/// Serialized as a plain table (`[evaluation.weights]`), one key per metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FitnessWeights(BTreeMap<String, f64>);

impl Default for FitnessWeights {
    fn default() -> Self {
        Self::new([
            ("survival_rate", 100.0),
            ("mean_distance", 0.5),
            ("final_alive", 50.0),
        ])
    }
}

impl FitnessWeights {
    pub fn new<K: Into<String>>(weights: impl IntoIterator<Item = (K, f64)>) -> Self {
        Self(
            weights
                .into_iter()
                .map(|(name, weight)| (name.into(), weight))
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, weight)| (name.as_str(), *weight))
    }

    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(anyhow!("evaluation.weights must name at least one metric"));
        }
        for (name, weight) in self.iter() {
            if !weight.is_finite() {
                return Err(anyhow!("evaluation.weights.{name} must be finite"));
            }
        }
        Ok(())
    }

    /// Weighted sum over one trial's metrics.
    pub fn score(&self, metrics: &Metrics) -> Result<f64, AggregateError> {
        let mut total = 0.0;
        for (name, weight) in self.iter() {
            let value = metrics
                .get(name)
                .ok_or_else(|| AggregateError::MissingMetric(name.to_string()))?;
            total += weight * value;
        }
        Ok(total)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregateError {
    #[error("no trials to aggregate")]
    NoTrials,
    #[error("simulation did not report metric `{0}`")]
    MissingMetric(String),
    #[error("aggregate fitness is not finite ({0})")]
    NonFinite(f64),
}

/// Fold per-trial metrics into one fitness and a diagnostic metric map.
///
/// Fitness is the mean per-trial score, which equals the weighted sum of the
/// metric means. The returned metrics hold the mean of every raw metric plus
/// trial count and per-trial score extremes.
pub fn aggregate(
    trials: &[Metrics],
    weights: &FitnessWeights,
) -> Result<(f64, Metrics), AggregateError> {
    if trials.is_empty() {
        return Err(AggregateError::NoTrials);
    }

    let mut scores = Vec::with_capacity(trials.len());
    for trial in trials {
        scores.push(weights.score(trial)?);
    }
    let fitness = scores.iter().sum::<f64>() / scores.len() as f64;
    if !fitness.is_finite() {
        return Err(AggregateError::NonFinite(fitness));
    }

    let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for trial in trials {
        for (name, value) in trial {
            let entry = sums.entry(name.as_str()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    let mut metrics: Metrics = sums
        .into_iter()
        .map(|(name, (sum, count))| (name.to_string(), sum / count as f64))
        .collect();
    metrics.insert(TRIALS_METRIC.to_string(), trials.len() as f64);
    metrics.insert(
        TRIAL_MIN_METRIC.to_string(),
        scores.iter().copied().fold(f64::INFINITY, f64::min),
    );
    metrics.insert(
        TRIAL_MAX_METRIC.to_string(),
        scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    );

    Ok((fitness, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial(survival: f64, distance: f64, alive: f64) -> Metrics {
        Metrics::from([
            ("survival_rate".to_string(), survival),
            ("mean_distance".to_string(), distance),
            ("final_alive".to_string(), alive),
        ])
    }

    #[test]
    fn default_weights_match_documented_combination() {
        let weights = FitnessWeights::default();
        let score = weights.score(&trial(1.0, 10.0, 1.0)).expect("score");
        assert!((score - 155.0).abs() < 1e-9);
    }

    #[test]
    fn aggregate_averages_trials_and_reports_extremes() {
        let weights = FitnessWeights::new([("survival_rate", 10.0)]);
        let (fitness, metrics) = aggregate(
            &[trial(0.2, 0.0, 0.0), trial(0.6, 0.0, 0.0)],
            &weights,
        )
        .expect("aggregate");

        assert!((fitness - 4.0).abs() < 1e-9);
        assert!((metrics["survival_rate"] - 0.4).abs() < 1e-9);
        assert_eq!(metrics[TRIALS_METRIC], 2.0);
        assert!((metrics[TRIAL_MIN_METRIC] - 2.0).abs() < 1e-9);
        assert!((metrics[TRIAL_MAX_METRIC] - 6.0).abs() < 1e-9);
    }

    #[test]
    fn aggregate_rejects_missing_metric() {
        let weights = FitnessWeights::new([("speed", 1.0)]);
        let err = aggregate(&[trial(1.0, 1.0, 1.0)], &weights).unwrap_err();
        assert_eq!(err, AggregateError::MissingMetric("speed".to_string()));
    }

    #[test]
    fn aggregate_rejects_empty_and_non_finite() {
        let weights = FitnessWeights::default();
        assert_eq!(aggregate(&[], &weights).unwrap_err(), AggregateError::NoTrials);

        let err = aggregate(&[trial(f64::NAN, 1.0, 1.0)], &weights).unwrap_err();
        assert!(matches!(err, AggregateError::NonFinite(_)));
    }

    #[test]
    fn validate_rejects_empty_weights() {
        let weights = FitnessWeights::new(Vec::<(String, f64)>::new());
        assert!(weights.validate().is_err());
    }
}

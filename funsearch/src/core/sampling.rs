//! Fitness-weighted parent sampling.
//!
//! Weights are computed over members ordered best-first. Both weighting
//! functions give the best member weight 1, so it is always drawable.

use anyhow::{Result, anyhow};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};

/// How fitness maps to a sampling weight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    /// `exp((f_i - f_max) / T)`.
    #[default]
    Softmax,
    /// `exp(-rank_i / T)` with rank 0 for the best member. Insensitive to
    /// the scale of fitness values.
    Rank,
}

/// Parent sampling settings (`[sampling]`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingPolicy {
    pub weighting: Weighting,
    /// Lower values concentrate draws on the best members.
    pub temperature: f64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            weighting: Weighting::Softmax,
            temperature: 1.0,
        }
    }
}

impl SamplingPolicy {
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(anyhow!("sampling.temperature must be a finite value > 0"));
        }
        Ok(())
    }

    /// Weights for fitness values ordered best-first.
    pub fn weights(&self, fitness_best_first: &[f64]) -> Vec<f64> {
        match self.weighting {
            Weighting::Softmax => {
                let Some(&top) = fitness_best_first.first() else {
                    return Vec::new();
                };
                fitness_best_first
                    .iter()
                    .map(|fitness| ((fitness - top) / self.temperature).exp())
                    .collect()
            }
            Weighting::Rank => (0..fitness_best_first.len())
                .map(|rank| (-(rank as f64) / self.temperature).exp())
                .collect(),
        }
    }
}

/// Draw up to `count` distinct indices, each draw proportional to the
/// remaining weights. Indices are returned in draw order.
///
/// Falls back to a uniform draw only when every remaining weight is zero.
pub fn draw_without_replacement<R: Rng + ?Sized>(
    weights: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut pool: Vec<(usize, f64)> = weights
        .iter()
        .enumerate()
        .map(|(index, weight)| (index, if weight.is_finite() { weight.max(0.0) } else { 0.0 }))
        .collect();
    let mut drawn = Vec::with_capacity(count.min(pool.len()));

    while drawn.len() < count && !pool.is_empty() {
        let position = match WeightedIndex::new(pool.iter().map(|(_, weight)| *weight)) {
            Ok(dist) => dist.sample(rng),
            Err(_) => rng.gen_range(0..pool.len()),
        };
        let (index, _) = pool.remove(position);
        drawn.push(index);
    }

    drawn
}

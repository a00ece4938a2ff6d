//! Task simulations that score a bound policy.
//!
//! A trial is a pure function of the policy's answers and its [`TrialSpec`]:
//! every random draw comes from an RNG seeded by `TrialSpec::seed`.

use anyhow::{Result, anyhow};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::core::policy::{Move, Observation, Policy, PolicyFault, WorldState};
use crate::core::types::Metrics;

/// Which trial of an evaluation is running and how it is seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialSpec {
    pub index: u32,
    pub seed: u64,
}

pub trait Simulation: Send + Sync {
    /// Run one trial, returning raw metrics. A fault from the policy ends
    /// the trial.
    fn run_trial(&self, policy: &mut dyn Policy, trial: &TrialSpec) -> Result<Metrics, PolicyFault>;
}

/// Predator-prey arena (`[simulation]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub width: f64,
    pub height: f64,
    pub mice: u32,
    pub predators: u32,
    pub max_steps: u32,
    pub predator_speed: f64,
    pub mouse_speed: f64,
    pub capture_distance: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            width: 100.0,
            height: 100.0,
            mice: 5,
            predators: 2,
            max_steps: 200,
            predator_speed: 1.5,
            mouse_speed: 1.0,
            capture_distance: 2.0,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("width", self.width),
            ("height", self.height),
            ("predator_speed", self.predator_speed),
            ("mouse_speed", self.mouse_speed),
            ("capture_distance", self.capture_distance),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!("simulation.{name} must be a finite value > 0"));
            }
        }
        if self.mice == 0 {
            return Err(anyhow!("simulation.mice must be > 0"));
        }
        if self.predators == 0 {
            return Err(anyhow!("simulation.predators must be > 0"));
        }
        if self.max_steps == 0 {
            return Err(anyhow!("simulation.max_steps must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Agent {
    x: f64,
    y: f64,
    alive: bool,
}

impl Agent {
    fn distance_to(&self, other: &Agent) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Mice controlled by the candidate flee predators that chase the nearest
/// live mouse.
///
/// Metrics per trial:
/// - `survival_rate`: mouse-steps survived over `mice * max_steps`
/// - `mean_distance`: mean distance to the nearest predator per survived step
/// - `final_alive`: share of mice alive at the end
#[derive(Debug, Clone, Default)]
pub struct PredatorPrey {
    config: SimulationConfig,
}

impl PredatorPrey {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    fn spawn<R: Rng>(&self, count: u32, rng: &mut R) -> Vec<Agent> {
        (0..count)
            .map(|_| Agent {
                x: rng.gen_range(0.0..=self.config.width),
                y: rng.gen_range(0.0..=self.config.height),
                alive: true,
            })
            .collect()
    }

    fn clip(&self, agent: &mut Agent) {
        agent.x = agent.x.clamp(0.0, self.config.width);
        agent.y = agent.y.clamp(0.0, self.config.height);
    }

    fn chase(&self, predator: &mut Agent, mice: &[Agent]) {
        let Some(target) = nearest(predator, mice.iter().filter(|mouse| mouse.alive)) else {
            return;
        };
        let heading = Move {
            dx: target.x - predator.x,
            dy: target.y - predator.y,
        }
        .scaled_to(self.config.predator_speed);
        predator.x += heading.dx;
        predator.y += heading.dy;
        self.clip(predator);
    }
}

fn nearest<'a>(from: &Agent, candidates: impl Iterator<Item = &'a Agent>) -> Option<&'a Agent> {
    candidates.min_by(|a, b| from.distance_to(a).total_cmp(&from.distance_to(b)))
}

impl Simulation for PredatorPrey {
    fn run_trial(&self, policy: &mut dyn Policy, trial: &TrialSpec) -> Result<Metrics, PolicyFault> {
        let config = &self.config;
        let mut rng = StdRng::seed_from_u64(trial.seed);
        let mut mice = self.spawn(config.mice, &mut rng);
        let mut predators = self.spawn(config.predators, &mut rng);

        let mut survived_steps = 0u64;
        let mut distance_total = 0.0;

        for step in 0..config.max_steps {
            let state = WorldState {
                step,
                width: config.width,
                height: config.height,
                num_alive: mice.iter().filter(|mouse| mouse.alive).count() as u32,
            };

            for mouse in mice.iter_mut().filter(|mouse| mouse.alive) {
                let Some(hunter) = nearest(mouse, predators.iter()).copied() else {
                    break;
                };
                let observation = Observation {
                    state,
                    mouse: [mouse.x, mouse.y],
                    predator: [hunter.x, hunter.y],
                };
                let requested = policy.act(&observation)?;
                if !requested.is_finite() {
                    return Err(PolicyFault::new(format!(
                        "non-finite move ({}, {})",
                        requested.dx, requested.dy
                    )));
                }
                let step_move = requested.scaled_to(config.mouse_speed);
                mouse.x += step_move.dx;
                mouse.y += step_move.dy;
                self.clip(mouse);

                survived_steps += 1;
                distance_total += mouse.distance_to(&hunter);
            }

            for predator in &mut predators {
                self.chase(predator, &mice);
            }

            for predator in &predators {
                for mouse in mice.iter_mut().filter(|mouse| mouse.alive) {
                    if predator.distance_to(mouse) < config.capture_distance {
                        mouse.alive = false;
                    }
                }
            }

            if mice.iter().all(|mouse| !mouse.alive) {
                break;
            }
        }

        let alive = mice.iter().filter(|mouse| mouse.alive).count();
        let mouse_steps = f64::from(config.mice) * f64::from(config.max_steps);
        Ok(Metrics::from([
            (
                "survival_rate".to_string(),
                survived_steps as f64 / mouse_steps,
            ),
            (
                "mean_distance".to_string(),
                distance_total / survived_steps.max(1) as f64,
            ),
            (
                "final_alive".to_string(),
                alive as f64 / f64::from(config.mice),
            ),
        ]))
    }
}

//! Calling convention between the simulation and a bound candidate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Global simulation state shown to the candidate each step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub step: u32,
    pub width: f64,
    pub height: f64,
    pub num_alive: u32,
}

/// One call's input: world state, own position, nearest predator position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub state: WorldState,
    pub mouse: [f64; 2],
    pub predator: [f64; 2],
}

/// Direction requested by the candidate. Only the heading matters; the
/// simulation rescales it to the mouse speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Move {
    pub dx: f64,
    pub dy: f64,
}

impl Move {
    pub const STAY: Move = Move { dx: 0.0, dy: 0.0 };

    pub fn is_finite(&self) -> bool {
        self.dx.is_finite() && self.dy.is_finite()
    }

    /// Rescale to length `speed`; a zero move stays zero.
    pub fn scaled_to(self, speed: f64) -> Move {
        let length = self.dx.hypot(self.dy);
        if length > 0.0 {
            Move {
                dx: self.dx / length * speed,
                dy: self.dy / length * speed,
            }
        } else {
            Move::STAY
        }
    }
}

/// The candidate raised, returned garbage, or its host went away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PolicyFault(pub String);

impl PolicyFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Forcibly stops a policy that is stuck inside `act`.
pub type KillSwitch = Box<dyn FnOnce() + Send>;

/// A candidate bound to the calling convention.
pub trait Policy: Send {
    fn act(&mut self, observation: &Observation) -> Result<Move, PolicyFault>;

    /// Handle that can interrupt a running `act` from another thread.
    /// In-process policies have none and are abandoned on timeout.
    fn kill_switch(&self) -> Option<KillSwitch> {
        None
    }
}

/// Adapts a closure into a [`Policy`].
pub struct FnPolicy<F>(pub F);

impl<F> Policy for FnPolicy<F>
where
    F: FnMut(&Observation) -> Result<Move, PolicyFault> + Send,
{
    fn act(&mut self, observation: &Observation) -> Result<Move, PolicyFault> {
        (self.0)(observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_to_normalizes_heading() {
        let scaled = Move { dx: 3.0, dy: 4.0 }.scaled_to(2.0);
        assert!((scaled.dx - 1.2).abs() < 1e-12);
        assert!((scaled.dy - 1.6).abs() < 1e-12);
        assert_eq!(Move::STAY.scaled_to(5.0), Move::STAY);
    }

    #[test]
    fn observation_serializes_as_calling_convention() {
        let observation = Observation {
            state: WorldState {
                step: 3,
                width: 100.0,
                height: 50.0,
                num_alive: 2,
            },
            mouse: [1.0, 2.0],
            predator: [3.0, 4.0],
        };
        let json = serde_json::to_value(observation).expect("serialize");
        assert_eq!(json["state"]["num_alive"], 2);
        assert_eq!(json["mouse"][1], 2.0);
        assert_eq!(json["predator"][0], 3.0);
    }

    #[test]
    fn fn_policy_forwards_calls() {
        let mut calls = 0;
        let mut policy = FnPolicy(|_: &Observation| {
            calls += 1;
            Ok::<_, PolicyFault>(Move { dx: 1.0, dy: 0.0 })
        });
        let observation = Observation {
            state: WorldState {
                step: 0,
                width: 1.0,
                height: 1.0,
                num_alive: 1,
            },
            mouse: [0.0, 0.0],
            predator: [0.0, 0.0],
        };
        assert!(policy.act(&observation).is_ok());
        assert!(policy.kill_switch().is_none());
        drop(policy);
        assert_eq!(calls, 1);
    }
}

//! Prompt builder for generator requests.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::Candidate;
use crate::io::generator::GenerateRequest;

const EVOLVE_TEMPLATE: &str = include_str!("prompts/evolve.md");
const PERTURB_TEMPLATE: &str = include_str!("prompts/perturb.md");

/// Parent as shown in a prompt.
#[derive(Debug, Clone, Serialize)]
struct ParentContext<'a> {
    generation: u64,
    fitness: String,
    source: &'a str,
}

impl<'a> ParentContext<'a> {
    fn from_candidate(candidate: &'a Candidate) -> Self {
        Self {
            generation: candidate.generation(),
            fitness: format!("{:.2}", candidate.fitness()),
            source: candidate.source().trim_end(),
        }
    }
}

/// Renders evolve and perturbation prompts (minijinja).
pub struct PromptBuilder {
    env: Environment<'static>,
    entry_point: String,
    trials: u32,
}

impl PromptBuilder {
    pub fn new(entry_point: &str, trials: u32) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("evolve", EVOLVE_TEMPLATE)
            .context("load evolve template")?;
        env.add_template("perturb", PERTURB_TEMPLATE)
            .context("load perturb template")?;
        Ok(Self {
            env,
            entry_point: entry_point.to_string(),
            trials,
        })
    }

    /// Request a better program given `parents`. Parents are listed weakest
    /// to strongest, in the prompt and in `context`.
    pub fn evolve(&self, parents: &[Candidate], temperature: f64) -> Result<GenerateRequest> {
        let mut ordered: Vec<&Candidate> = parents.iter().collect();
        ordered.sort_by(|a, b| {
            a.fitness()
                .total_cmp(&b.fitness())
                .then_with(|| b.generation().cmp(&a.generation()))
        });
        let shown: Vec<ParentContext<'_>> = ordered
            .iter()
            .map(|parent| ParentContext::from_candidate(parent))
            .collect();

        let prompt = self
            .env
            .get_template("evolve")?
            .render(context! {
                entry_point => &self.entry_point,
                trials => self.trials,
                parents => shown,
            })
            .context("render evolve prompt")?;
        debug!(parents = parents.len(), bytes = prompt.len(), "rendered evolve prompt");

        Ok(GenerateRequest {
            prompt,
            context: ordered
                .iter()
                .map(|parent| parent.source().to_string())
                .collect(),
            temperature,
        })
    }

    /// Request a small variation of `champion` to reseed `island_id`.
    pub fn perturb(
        &self,
        champion: &Candidate,
        island_id: usize,
        temperature: f64,
    ) -> Result<GenerateRequest> {
        let prompt = self
            .env
            .get_template("perturb")?
            .render(context! {
                entry_point => &self.entry_point,
                champion => ParentContext::from_candidate(champion),
                island_id => island_id,
            })
            .context("render perturb prompt")?;
        Ok(GenerateRequest {
            prompt,
            context: vec![champion.source().to_string()],
            temperature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::candidate_with_source;

    #[test]
    fn evolve_lists_parents_weakest_first() {
        let builder = PromptBuilder::new("mice_behavior", 10).expect("builder");
        let parents = vec![
            candidate_with_source("def mice_behavior(s, m, p):\n    return (1, 0)\n", 9.5, 4, 0),
            candidate_with_source("def mice_behavior(s, m, p):\n    return (0, 1)\n", 2.25, 2, 0),
        ];
        let request = builder.evolve(&parents, 0.8).expect("render");

        let weak = request.prompt.find("return (0, 1)").expect("weak parent");
        let strong = request.prompt.find("return (1, 0)").expect("strong parent");
        assert!(weak < strong);
        assert!(request.prompt.contains("Version 0 (fitness 2.25)"));
        assert!(request.prompt.contains("Version 1 (fitness 9.50)"));
        assert!(request.prompt.contains("Write version 2 of `mice_behavior`"));
        assert!(request.prompt.contains("averaged over 10 seeded trials"));
        assert_eq!(request.context.len(), 2);
        assert!(request.context[0].contains("return (0, 1)"));
        assert_eq!(request.temperature, 0.8);
    }

    #[test]
    fn perturb_shows_champion_and_island() {
        let builder = PromptBuilder::new("mice_behavior", 3).expect("builder");
        let champion = candidate_with_source("def mice_behavior(s, m, p):\n    return (2, 2)\n", 77.0, 9, 1);
        let request = builder.perturb(&champion, 3, 0.3).expect("render");
        assert!(request.prompt.contains("return (2, 2)"));
        assert!(request.prompt.contains("fitness 77.00"));
        assert!(request.prompt.contains("island 3"));
        assert_eq!(request.context, vec![champion.source().to_string()]);
    }
}

//! Search configuration stored in `funsearch.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::database::DatabaseConfig;
use crate::core::fitness::FitnessWeights;
use crate::core::sampling::SamplingPolicy;
use crate::core::simulation::SimulationConfig;

/// Default config file name, relative to the working directory.
pub const CONFIG_FILE: &str = "funsearch.toml";

/// Search configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to the
/// values documented on each section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    /// Iterations before the run completes.
    pub max_iterations: u32,

    /// Candidates requested from the generator per iteration.
    pub samples_per_iteration: usize,

    /// Parents drawn from the chosen island and shown in each prompt.
    pub parents_per_prompt: usize,

    /// Threads evaluating one iteration's candidates. 1 is sequential.
    pub eval_workers: usize,

    /// Seed for parent sampling and the catalog generator.
    pub rng_seed: u64,

    /// Emit an `info` progress line every this many iterations (0 = never).
    pub log_interval: u32,

    pub database: DatabaseConfig,
    pub sampling: SamplingPolicy,
    pub evaluation: EvaluationConfig,
    pub simulation: SimulationConfig,
    pub sandbox: SandboxConfig,
    pub generator: GeneratorConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            samples_per_iteration: 1,
            parents_per_prompt: 2,
            eval_workers: 1,
            rng_seed: 0,
            log_interval: 10,
            database: DatabaseConfig::default(),
            sampling: SamplingPolicy::default(),
            evaluation: EvaluationConfig::default(),
            simulation: SimulationConfig::default(),
            sandbox: SandboxConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.samples_per_iteration == 0 {
            return Err(anyhow!("samples_per_iteration must be > 0"));
        }
        if self.parents_per_prompt == 0 {
            return Err(anyhow!("parents_per_prompt must be > 0"));
        }
        if self.eval_workers == 0 {
            return Err(anyhow!("eval_workers must be > 0"));
        }
        self.database.validate()?;
        self.sampling.validate()?;
        self.evaluation.validate()?;
        self.simulation.validate()?;
        self.sandbox.validate()?;
        self.generator.validate()?;
        Ok(())
    }
}

/// Trial settings (`[evaluation]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Independent trials averaged into one fitness.
    pub trials: u32,

    /// Hard deadline per trial.
    pub trial_timeout_ms: u64,

    /// Deadline for loading a candidate before its first trial.
    pub bind_timeout_ms: u64,

    /// Trial `i` is seeded with `base_seed + i`.
    pub base_seed: u64,

    /// Metric name -> weight; fitness is the weighted sum of metric means.
    pub weights: FitnessWeights,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            trials: 10,
            trial_timeout_ms: 2_000,
            bind_timeout_ms: 5_000,
            base_seed: 0,
            weights: FitnessWeights::default(),
        }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.trials == 0 {
            return Err(anyhow!("evaluation.trials must be > 0"));
        }
        if self.trial_timeout_ms == 0 {
            return Err(anyhow!("evaluation.trial_timeout_ms must be > 0"));
        }
        if self.bind_timeout_ms == 0 {
            return Err(anyhow!("evaluation.bind_timeout_ms must be > 0"));
        }
        self.weights.validate()
    }

    pub fn trial_timeout(&self) -> Duration {
        Duration::from_millis(self.trial_timeout_ms)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }
}

/// Candidate host process (`[sandbox]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter argv; the driver and candidate paths are appended.
    pub interpreter: Vec<String>,

    /// Function each candidate must define.
    pub entry_point: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string(), "-u".to_string()],
            entry_point: "mice_behavior".to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interpreter.is_empty() || self.interpreter[0].trim().is_empty() {
            return Err(anyhow!("sandbox.interpreter must be a non-empty array"));
        }
        if self.entry_point.trim().is_empty() {
            return Err(anyhow!("sandbox.entry_point must not be empty"));
        }
        Ok(())
    }
}

/// Where candidate programs come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    /// Built-in library of behaviors with random parameter mutation.
    #[default]
    Catalog,
    /// External command (e.g. a wrapper around a language model CLI).
    Command,
}

/// What the command generator receives on stdin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptInput {
    /// The rendered prompt as plain text.
    #[default]
    Text,
    /// The whole request (`prompt`, `context`, `temperature`) as JSON.
    Json,
}

/// Candidate generator (`[generator]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub kind: GeneratorKind,

    /// Command argv for `kind = "command"`.
    pub command: Vec<String>,

    pub input: PromptInput,

    /// Sampling temperature passed with evolve requests.
    pub temperature: f64,

    /// Sampling temperature passed with migration perturbation requests.
    pub perturbation_temperature: f64,

    /// Wall-clock budget per generator call.
    pub timeout_secs: u64,

    /// Truncate generator stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            kind: GeneratorKind::Catalog,
            command: Vec::new(),
            input: PromptInput::Text,
            temperature: 0.8,
            perturbation_temperature: 0.3,
            timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kind == GeneratorKind::Command
            && (self.command.is_empty() || self.command[0].trim().is_empty())
        {
            return Err(anyhow!(
                "generator.command must be a non-empty array when generator.kind = \"command\""
            ));
        }
        for (name, value) in [
            ("temperature", self.temperature),
            ("perturbation_temperature", self.perturbation_temperature),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("generator.{name} must be a finite value >= 0"));
            }
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SearchConfig::default()`.
pub fn load_config(path: &Path) -> Result<SearchConfig> {
    if !path.exists() {
        let cfg = SearchConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SearchConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SearchConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Replace `path` with `contents` via a sibling temp file.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    std::io::Write::write_all(&mut tmp, contents.as_bytes())
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::database::IslandSelection;
    use crate::core::sampling::Weighting;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SearchConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join(CONFIG_FILE);
        let mut cfg = SearchConfig::default();
        cfg.database.islands = 7;
        cfg.sampling.weighting = Weighting::Rank;
        cfg.evaluation.weights = FitnessWeights::new([("survival_rate", 1.0)]);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "max_iterations = 3\n\n[database]\nisland_selection = \"round_robin\"\n\n[evaluation.weights]\nfinal_alive = 2.0\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 3);
        assert_eq!(cfg.database.island_selection, IslandSelection::RoundRobin);
        assert_eq!(cfg.database.islands, 4);
        assert_eq!(
            cfg.evaluation.weights,
            FitnessWeights::new([("final_alive", 2.0)])
        );
        assert_eq!(cfg.sandbox, SandboxConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        fs::write(&path, "[database]\nislands = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("database.islands"), "{err:#}");
    }

    #[test]
    fn command_generator_requires_command() {
        let mut cfg = SearchConfig::default();
        cfg.generator.kind = GeneratorKind::Command;
        assert!(cfg.validate().is_err());
        cfg.generator.command = vec!["llm".to_string()];
        assert!(cfg.validate().is_ok());
    }
}

//! Candidate generator abstraction.
//!
//! The [`Generator`] trait decouples the search loop from the text-generation
//! backend. [`CommandGenerator`] pipes the prompt to an external command (any
//! language-model CLI wrapper); [`CatalogGenerator`] needs no external tools
//! and mutates a built-in library of behaviors. Tests use scripted generators.

use std::process::Command;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::io::config::{GeneratorConfig, GeneratorKind, PromptInput};
use crate::io::process::run_command_with_timeout;

/// Environment variable carrying the request temperature to command generators.
pub const TEMPERATURE_ENV: &str = "FUNSEARCH_TEMPERATURE";

/// Built-in behaviors, by name.
pub const CATALOG: &[(&str, &str)] = &[
    ("flee", include_str!("catalog/flee.py")),
    ("zigzag", include_str!("catalog/zigzag.py")),
    ("edges", include_str!("catalog/edges.py")),
    ("center", include_str!("catalog/center.py")),
    ("orbit", include_str!("catalog/orbit.py")),
];

/// Source of a built-in behavior.
pub fn catalog_source(name: &str) -> Option<&'static str> {
    CATALOG
        .iter()
        .find(|(entry, _)| *entry == name)
        .map(|(_, source)| *source)
}

/// One generation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateRequest {
    /// Rendered prompt text.
    pub prompt: String,
    /// Parent sources shown in the prompt, weakest first.
    pub context: Vec<String>,
    pub temperature: f64,
}

/// Abstraction over text-generation backends.
pub trait Generator: Send + Sync {
    /// Return raw generator text for `request`. An error means the backend
    /// itself is unavailable; unusable text is not an error.
    fn generate(&self, request: &GenerateRequest) -> Result<String>;
}

impl<G: Generator + ?Sized> Generator for Box<G> {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        (**self).generate(request)
    }
}

/// Generator that runs `[generator].command` once per request.
pub struct CommandGenerator {
    command: Vec<String>,
    input: PromptInput,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("generator.command is empty"));
        }
        Ok(Self {
            command: config.command.clone(),
            input: config.input,
            timeout: config.timeout(),
            output_limit_bytes: config.output_limit_bytes,
        })
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(temperature = request.temperature))]
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .env(TEMPERATURE_ENV, request.temperature.to_string());

        let stdin = match self.input {
            PromptInput::Text => request.prompt.clone().into_bytes(),
            PromptInput::Json => serde_json::to_vec(request).context("encode generate request")?,
        };

        let output = run_command_with_timeout(cmd, Some(&stdin), self.timeout, self.output_limit_bytes)
            .context("run generator command")?;
        output.ensure_success("generator command")?;
        let text = output.stdout_lossy();
        debug!(bytes = text.len(), "generator returned");
        Ok(text)
    }
}

/// Offline generator: recombines built-in behaviors and parent sources,
/// jittering their numeric constants by an amount that grows with the
/// request temperature.
pub struct CatalogGenerator {
    rng: Mutex<StdRng>,
}

impl CatalogGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Generator for CatalogGenerator {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| anyhow!("catalog generator rng poisoned"))?;
        let base = match request.context.choose(&mut *rng) {
            Some(parent) if rng.gen_bool(0.7) => parent.as_str(),
            _ => {
                let (_, source) = CATALOG
                    .choose(&mut *rng)
                    .ok_or_else(|| anyhow!("catalog is empty"))?;
                *source
            }
        };
        let mutated = jitter_constants(base, request.temperature, &mut *rng);
        Ok(format!("```python\n{}\n```\n", mutated.trim_end()))
    }
}

/// Scale each decimal literal by a random factor in `1 ± temperature / 2`.
/// Integer literals are kept, so indices and loop bounds survive.
fn jitter_constants<R: Rng + ?Sized>(source: &str, temperature: f64, rng: &mut R) -> String {
    static DECIMAL_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\b\d+\.\d+\b").expect("decimal regex"));

    let spread = (temperature / 2.0).clamp(0.0, 0.9);
    if spread == 0.0 {
        return source.to_string();
    }
    DECIMAL_RE
        .replace_all(source, |caps: &regex::Captures<'_>| {
            let literal = &caps[0];
            let Ok(value) = literal.parse::<f64>() else {
                return literal.to_string();
            };
            if !rng.gen_bool(0.5) {
                return literal.to_string();
            }
            let factor = 1.0 + rng.gen_range(-spread..=spread);
            format!("{:.4}", value * factor)
        })
        .into_owned()
}

/// Build the generator named by `[generator].kind`.
pub fn build_generator(config: &GeneratorConfig, seed: u64) -> Result<Box<dyn Generator>> {
    match config.kind {
        GeneratorKind::Catalog => {
            info!(seed, "using built-in catalog generator");
            Ok(Box::new(CatalogGenerator::new(seed)))
        }
        GeneratorKind::Command => {
            info!(command = ?config.command, "using command generator");
            Ok(Box::new(CommandGenerator::new(config)?))
        }
    }
}

/// Pull program text out of generator output.
///
/// Prefers the first fenced block that defines a function, then the first
/// fenced block, then the whole text. The result ends with one newline.
pub fn extract_code(text: &str) -> String {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("fence regex")
    });

    let blocks: Vec<&str> = FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|block| block.as_str()))
        .collect();
    let code = blocks
        .iter()
        .find(|block| block.contains("def "))
        .or_else(|| blocks.first())
        .copied()
        .unwrap_or(text);
    let mut code = code.trim_matches('\n').trim_end().to_string();
    code.push('\n');
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(context: Vec<String>, temperature: f64) -> GenerateRequest {
        GenerateRequest {
            prompt: "write a behavior".to_string(),
            context,
            temperature,
        }
    }

    #[test]
    fn extract_prefers_fenced_function() {
        let text = "Here you go:\n```\nnotes\n```\n```python\ndef mice_behavior(s, m, p):\n    return (1.0, 0.0)\n```\nDone.";
        assert_eq!(
            extract_code(text),
            "def mice_behavior(s, m, p):\n    return (1.0, 0.0)\n"
        );
    }

    #[test]
    fn extract_falls_back_to_whole_text() {
        assert_eq!(extract_code("\ndef f():\n    pass\n\n"), "def f():\n    pass\n");
    }

    #[test]
    fn catalog_has_entry_point_everywhere() {
        for (name, source) in CATALOG {
            assert!(
                source.contains("def mice_behavior(state, mouse_pos, predator_pos)"),
                "{name}"
            );
        }
        assert!(catalog_source("flee").is_some());
        assert!(catalog_source("teleport").is_none());
    }

    #[test]
    fn catalog_generator_is_reproducible() {
        let a = CatalogGenerator::new(11);
        let b = CatalogGenerator::new(11);
        for _ in 0..5 {
            let req = request(Vec::new(), 0.8);
            assert_eq!(a.generate(&req).expect("a"), b.generate(&req).expect("b"));
        }
    }

    #[test]
    fn catalog_output_extracts_to_a_behavior() {
        let generator = CatalogGenerator::new(3);
        let parent = catalog_source("flee").expect("flee").to_string();
        let text = generator
            .generate(&request(vec![parent], 0.5))
            .expect("generate");
        assert!(extract_code(&text).contains("def mice_behavior"));
    }

    #[test]
    fn zero_temperature_keeps_constants() {
        let mut rng = StdRng::seed_from_u64(0);
        let source = "x = 0.5\ny = 2\n";
        assert_eq!(jitter_constants(source, 0.0, &mut rng), source);
    }

    #[test]
    fn jitter_keeps_integers_and_stays_within_spread() {
        let mut rng = StdRng::seed_from_u64(5);
        let out = jitter_constants("a = 10.0\nb = 3\n", 0.4, &mut rng);
        assert!(out.contains("b = 3\n"));
        let value: f64 = out
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("a = "))
            .expect("a line")
            .parse()
            .expect("number");
        assert!((8.0..=12.0).contains(&value), "{value}");
    }

    #[test]
    fn build_command_generator_requires_command() {
        let config = GeneratorConfig {
            kind: GeneratorKind::Command,
            ..GeneratorConfig::default()
        };
        assert!(build_generator(&config, 0).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_generator_pipes_prompt_and_temperature() {
        let config = GeneratorConfig {
            kind: GeneratorKind::Command,
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat; printf ' T=%s' \"$FUNSEARCH_TEMPERATURE\"".to_string(),
            ],
            ..GeneratorConfig::default()
        };
        let generator = CommandGenerator::new(&config).expect("generator");
        let text = generator.generate(&request(Vec::new(), 0.25)).expect("generate");
        assert_eq!(text, "write a behavior T=0.25");
    }

    #[cfg(unix)]
    #[test]
    fn command_generator_json_input_carries_context() {
        let config = GeneratorConfig {
            kind: GeneratorKind::Command,
            command: vec!["cat".to_string()],
            input: PromptInput::Json,
            ..GeneratorConfig::default()
        };
        let generator = CommandGenerator::new(&config).expect("generator");
        let text = generator
            .generate(&request(vec!["def a(): pass".to_string()], 1.0))
            .expect("generate");
        let json: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(json["context"][0], "def a(): pass");
        assert_eq!(json["prompt"], "write a behavior");
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_error() {
        let config = GeneratorConfig {
            kind: GeneratorKind::Command,
            command: vec!["false".to_string()],
            ..GeneratorConfig::default()
        };
        let generator = CommandGenerator::new(&config).expect("generator");
        assert!(generator.generate(&request(Vec::new(), 1.0)).is_err());
    }
}

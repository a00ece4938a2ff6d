//! Binding candidate source to the [`Policy`] calling convention.
//!
//! The [`Sandbox`] trait decouples evaluation from the candidate host.
//! [`ProcessSandbox`] loads each candidate into its own interpreter process
//! through a small driver script and talks to it with one JSON line per call;
//! the process is the isolation boundary and is killed on timeout. Tests use
//! scripted sandboxes that bind to in-process policies.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::policy::{KillSwitch, Move, Observation, Policy, PolicyFault};
use crate::core::types::EvalStatus;
use crate::io::config::SandboxConfig;

const PYTHON_DRIVER: &str = include_str!("drivers/python.py");

/// Why a candidate could not be bound.
#[derive(Debug, Error)]
pub enum BindError {
    /// The candidate did not load or lacks the entry point.
    #[error("candidate failed to load: {0}")]
    Invalid(String),
    /// Loading did not finish before the bind deadline.
    #[error("candidate load exceeded {0:?}")]
    Timeout(Duration),
    /// The host itself could not be started.
    #[error("sandbox unavailable: {0:#}")]
    Unavailable(anyhow::Error),
}

impl BindError {
    pub fn status(&self) -> EvalStatus {
        match self {
            BindError::Invalid(_) => EvalStatus::InvalidSyntax,
            BindError::Timeout(_) => EvalStatus::Timeout,
            BindError::Unavailable(_) => EvalStatus::RuntimeFailure,
        }
    }
}

/// Turns candidate source into a callable policy.
pub trait Sandbox: Send + Sync {
    fn bind(&self, source: &str) -> Result<Box<dyn Policy>, BindError>;
}

impl<S: Sandbox + ?Sized> Sandbox for Box<S> {
    fn bind(&self, source: &str) -> Result<Box<dyn Policy>, BindError> {
        (**self).bind(source)
    }
}

/// One line from the driver.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
struct DriverReply {
    ready: bool,
    bind_error: Option<String>,
    action: Option<[f64; 2]>,
    fault: Option<String>,
}

fn parse_reply(line: &str) -> Result<DriverReply> {
    serde_json::from_str(line).with_context(|| format!("parse driver reply {line:?}"))
}

/// Hosts candidates in an interpreter process (`[sandbox]`).
pub struct ProcessSandbox {
    config: SandboxConfig,
    bind_timeout: Duration,
    driver: NamedTempFile,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig, bind_timeout: Duration) -> Result<Self> {
        config.validate()?;
        let mut driver = tempfile::Builder::new()
            .prefix("funsearch-driver-")
            .suffix(".py")
            .tempfile()
            .context("create driver file")?;
        driver
            .write_all(PYTHON_DRIVER.as_bytes())
            .context("write driver file")?;
        driver.flush().context("flush driver file")?;
        Ok(Self {
            config,
            bind_timeout,
            driver,
        })
    }

    fn command(&self, candidate: &NamedTempFile) -> Result<Command> {
        let (program, args) = self
            .config
            .interpreter
            .split_first()
            .ok_or_else(|| anyhow!("sandbox.interpreter is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(self.driver.path())
            .arg(candidate.path())
            .arg(&self.config.entry_point)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        Ok(cmd)
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(bytes = source.len()))]
    fn bind(&self, source: &str) -> Result<Box<dyn Policy>, BindError> {
        let mut candidate = tempfile::Builder::new()
            .prefix("funsearch-candidate-")
            .suffix(".py")
            .tempfile()
            .context("create candidate file")
            .map_err(BindError::Unavailable)?;
        candidate
            .write_all(source.as_bytes())
            .and_then(|()| candidate.flush())
            .context("write candidate file")
            .map_err(BindError::Unavailable)?;

        let mut cmd = self.command(&candidate).map_err(BindError::Unavailable)?;
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(err = %e, interpreter = ?self.config.interpreter, "failed to spawn sandbox");
                return Err(BindError::Unavailable(
                    anyhow::Error::new(e).context("spawn sandbox interpreter"),
                ));
            }
        };

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                reap(&mut child);
                return Err(BindError::Unavailable(anyhow!("sandbox pipes were not set up")));
            }
        };

        let (tx, replies) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let deadline = Instant::now() + self.bind_timeout;
        let handshake = match replies.recv_timeout(self.bind_timeout) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = self.bind_timeout.as_millis() as u64, "bind timed out, killing");
                reap(&mut child);
                return Err(BindError::Timeout(self.bind_timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Protocol stdout closed; the host may still be running.
                let remaining = deadline.saturating_duration_since(Instant::now());
                return match child.wait_timeout(remaining) {
                    Ok(Some(status)) => Err(BindError::Invalid(format!(
                        "host exited during load (code {:?})",
                        status.code()
                    ))),
                    Ok(None) | Err(_) => {
                        warn!("host closed its output without exiting, killing");
                        reap(&mut child);
                        Err(BindError::Timeout(self.bind_timeout))
                    }
                };
            }
        };

        let reply = match parse_reply(&handshake) {
            Ok(reply) => reply,
            Err(e) => {
                reap(&mut child);
                return Err(BindError::Invalid(format!("{e:#}")));
            }
        };
        if let Some(message) = reply.bind_error {
            reap(&mut child);
            return Err(BindError::Invalid(message));
        }
        if !reply.ready {
            reap(&mut child);
            return Err(BindError::Invalid(format!("unexpected handshake {handshake:?}")));
        }

        debug!(pid = child.id(), "candidate bound");
        Ok(Box::new(ProcessPolicy {
            child: Arc::new(Mutex::new(child)),
            stdin,
            replies,
            _candidate: candidate,
        }))
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// A candidate loaded in a live interpreter process.
struct ProcessPolicy {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    replies: Receiver<String>,
    _candidate: NamedTempFile,
}

impl Policy for ProcessPolicy {
    fn act(&mut self, observation: &Observation) -> Result<Move, PolicyFault> {
        let mut line = serde_json::to_string(observation)
            .map_err(|e| PolicyFault::new(format!("encode observation: {e}")))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|()| self.stdin.flush())
            .map_err(|e| PolicyFault::new(format!("sandbox stdin closed: {e}")))?;

        let reply = self
            .replies
            .recv()
            .map_err(|_| PolicyFault::new("sandbox exited mid-trial"))?;
        let reply = parse_reply(&reply).map_err(|e| PolicyFault::new(format!("{e:#}")))?;
        match (reply.action, reply.fault) {
            (_, Some(fault)) => Err(PolicyFault(fault)),
            (Some([dx, dy]), None) => Ok(Move { dx, dy }),
            (None, None) => Err(PolicyFault::new("driver reply carried no action")),
        }
    }

    fn kill_switch(&self) -> Option<KillSwitch> {
        let child = Arc::clone(&self.child);
        Some(Box::new(move || {
            if let Ok(mut child) = child.lock() {
                let _ = child.kill();
            }
        }))
    }
}

impl Drop for ProcessPolicy {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            reap(&mut child);
        }
    }
}

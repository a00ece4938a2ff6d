//! Evolutionary program search over an island-model program database.
//!
//! A generator proposes candidate programs conditioned on strong parents, the
//! evaluator scores each candidate over seeded simulation trials, and the
//! database retains the fittest per island. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (islands, database, sampling,
//!   fitness, the simulation). No process or filesystem I/O.
//! - **[`io`]**: Side-effecting operations (config files, child processes,
//!   prompt rendering, run artifacts). Isolated behind traits for tests.
//!
//! Orchestration modules ([`evaluate`], [`start`], [`step`], [`looping`])
//! coordinate the two to implement CLI commands.

pub mod core;
pub mod evaluate;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

//! I/O helpers: config, processes, candidate hosting, generation, run artifacts.

pub mod config;
pub mod generator;
pub mod init;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod sandbox;

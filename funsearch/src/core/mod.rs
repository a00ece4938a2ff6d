//! Deterministic, pure logic for the search core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures; randomness is always injected by the caller.

pub mod database;
pub mod errors;
pub mod fitness;
pub mod island;
pub mod policy;
pub mod sampling;
pub mod simulation;
pub mod types;

//! Stable exit codes for `funsearch` CLI commands.

/// Command succeeded; `run` completed every iteration; `evaluate` scored `valid`.
pub const OK: i32 = 0;
/// Invalid config, unreadable input, an unusable seed program, or another error.
pub const INVALID: i32 = 1;
/// `run` stopped early (generator unavailable or cancelled).
pub const ABORTED: i32 = 2;
/// `evaluate` finished but the candidate was not `valid`.
pub const REJECTED: i32 = 3;

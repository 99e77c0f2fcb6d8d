//! Stable exit codes for refiner CLI commands.

/// Command succeeded; `run` reached a final answer.
pub const OK: i32 = 0;
/// Invalid config/session/arguments, provider failure or other errors.
pub const INVALID: i32 = 1;
/// `run` stopped at `max_iterations` (or was cancelled) without completing.
pub const INCOMPLETE: i32 = 2;
/// A fatal invariant violation aborted the task.
pub const FATAL: i32 = 3;

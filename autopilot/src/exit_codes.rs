//! Stable exit codes for `autopilot` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, config or state, or any other error.
pub const INVALID: i32 = 1;
/// A check completed and reported problems (graph errors, denied admission).
pub const REJECTED: i32 = 2;
/// The router has no tier that can take the task.
pub const UNAVAILABLE: i32 = 3;

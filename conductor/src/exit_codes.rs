//! Stable exit codes for conductor CLI commands.

/// Command succeeded: final answer, committed workflow, or successful action.
pub const OK: i32 = 0;
/// Invalid invocation, config or arguments, or an unexpected error.
pub const INVALID: i32 = 1;
/// `conductor dispatch` ran an action that failed, or the agent's task failed.
pub const TOOL_FAILED: i32 = 2;
/// `conductor agent` used all of its steps without a final answer.
pub const STEP_LIMIT: i32 = 3;
/// `conductor build` abandoned the workflow.
pub const ABANDONED: i32 = 4;

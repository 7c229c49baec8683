//! Agent loop and the task runner built on it.

pub mod agent_loop;
pub mod task_runner;

pub use agent_loop::{AgentLoop, LoopOutcome, StepOutcome, StepRecord};
pub use task_runner::{CHAT_TASK_TYPE, TaskHandler, TaskRunner, ToolAgent};

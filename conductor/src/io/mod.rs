//! Side-effecting adapters: processes, files, git, logs, config, model access.

pub mod atomic;
pub mod config;
pub mod connector;
pub mod exec_log;
pub mod git;
pub mod lint;
pub mod process;
pub mod prompt;
pub mod workflow_log;
pub mod workspace;

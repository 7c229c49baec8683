//! Typed failure kinds shared by the dispatcher, the agent loop and the workflow.
//!
//! Adapters return `anyhow::Result` and attach context as they go. The kinds
//! below are what survives at the boundaries: the dispatcher folds every
//! failure into a [`ErrorKind`]-tagged result, and the loop/workflow report
//! their terminal failures with the same vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of every failure that can be observed by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The requested action is not registered (or not visible in this mode).
    ToolNotFound,
    /// The action's implementation returned an error or panicked.
    ToolExecutionError,
    /// A follow-up hook failed. Never propagates to the triggering action.
    HookExecutionError,
    /// Model output or call arguments did not match the expected structure.
    ParseError,
    /// The agent loop used all of its steps without a final answer.
    StepLimitReached,
    /// The debug phase used all retries without passing tests.
    DebugExhausted,
    /// The debug phase could not locate a target file from the failure output.
    DebugUnidentifiable,
    /// The model connector produced no corrective content for a debug attempt.
    DebugNoFix,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ToolNotFound => "ToolNotFound",
            ErrorKind::ToolExecutionError => "ToolExecutionError",
            ErrorKind::HookExecutionError => "HookExecutionError",
            ErrorKind::ParseError => "ParseError",
            ErrorKind::StepLimitReached => "StepLimitReached",
            ErrorKind::DebugExhausted => "DebugExhausted",
            ErrorKind::DebugUnidentifiable => "DebugUnidentifiable",
            ErrorKind::DebugNoFix => "DebugNoFix",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw tool-call arguments that could not be turned into an argument map.
#[derive(Debug, Error)]
pub enum ArgumentsError {
    #[error("arguments are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("{0}")]
    Malformed(String),
}

/// A required argument was missing or had the wrong shape inside a tool body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("missing required argument '{0}'")]
    Missing(String),
    #[error("argument '{name}' must be {expected}")]
    WrongType { name: String, expected: &'static str },
}

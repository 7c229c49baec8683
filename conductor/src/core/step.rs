//! Workflow phases and the steps recorded for them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::extract::FailingTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    CodeGen,
    Test,
    Debug,
    Commit,
    Abandoned,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::CodeGen => "code_gen",
            Phase::Test => "test",
            Phase::Debug => "debug",
            Phase::Commit => "commit",
            Phase::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Commit | Phase::Abandoned)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One repair-and-retest cycle inside the debug phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugAttempt {
    /// 1-based.
    pub attempt: u32,
    pub target: FailingTarget,
    pub tests_passed: bool,
    /// Test output after the fix was applied.
    pub output: String,
}

/// Record appended to the workflow log for every phase that ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub phase: Phase,
    /// `phase` plus an outcome suffix for tests (`test:success`, `test:failure`).
    pub label: String,
    pub description: String,
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<DebugAttempt>,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowStep {
    pub fn new(phase: Phase, description: impl Into<String>, success: bool, payload: Value) -> Self {
        let label = match phase {
            Phase::Test if success => "test:success".to_string(),
            Phase::Test => "test:failure".to_string(),
            other => other.as_str().to_string(),
        };
        Self {
            phase,
            label,
            description: description.into(),
            success,
            payload,
            attempts: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_attempts(mut self, attempts: Vec<DebugAttempt>) -> Self {
        self.attempts = attempts;
        self
    }
}

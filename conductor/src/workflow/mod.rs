//! Build/debug/commit workflow.
//!
//! `Plan → CodeGen → Test → {Commit | Debug}`, with `Debug` ending in
//! `Commit` once the suite passes or `Abandoned` when the repair budget runs
//! out. Every phase appends one [`WorkflowStep`] to the workflow log.

mod debug;
mod machine;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::plan::BuildPlan;
use crate::core::step::{Phase, WorkflowStep};
use crate::core::types::ToolResult;
use crate::error::ErrorKind;
use crate::io::atomic::write_atomic;

pub use machine::Workflow;

/// Phase-by-phase callers keep [`WorkflowState`] here between invocations.
pub const WORKFLOW_STATE_FILE: &str = "workflow_state.json";

/// Last observed test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub output: String,
}

impl TestReport {
    /// Read a `run_tests` dispatch result. Failing runs carry their output in
    /// the error data; anything else falls back to the error message.
    pub fn from_result(result: &ToolResult) -> Self {
        if result.success {
            let output = result.result["output"].as_str().unwrap_or_default();
            return Self {
                passed: true,
                output: output.to_string(),
            };
        }
        let output = result
            .error
            .as_ref()
            .and_then(|failure| failure.data.as_ref())
            .and_then(|data| data["output"].as_str().map(str::to_string))
            .or_else(|| result.error_message().map(str::to_string))
            .unwrap_or_default();
        Self {
            passed: false,
            output,
        }
    }
}

/// What the workflow knows between phases. Phases may be driven one at a
/// time (the RPC surface does), so everything a later phase needs lives here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub goal: Option<String>,
    pub plan: Option<BuildPlan>,
    /// Paths written by code generation, in write order.
    #[serde(default)]
    pub generated: Vec<String>,
    pub last_test: Option<TestReport>,
    /// Most recent phase that ran.
    pub phase: Option<Phase>,
}

/// Load saved state. A missing file is a fresh workflow.
pub fn load_state(path: &Path) -> Result<WorkflowState> {
    if !path.exists() {
        return Ok(WorkflowState::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

pub fn save_state(path: &Path, state: &WorkflowState) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(state).context("serialize workflow state")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DebugOutcome {
    /// Tests pass after `attempts` repair cycles.
    Fixed { attempts: u32 },
    Exhausted { attempts: u32 },
    Unidentifiable { reason: String },
    /// The connector produced nothing usable on cycle `attempt`.
    NoFix { attempt: u32, reason: String },
}

impl DebugOutcome {
    pub fn is_fixed(&self) -> bool {
        matches!(self, DebugOutcome::Fixed { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            DebugOutcome::Fixed { .. } => None,
            DebugOutcome::Exhausted { .. } => Some(ErrorKind::DebugExhausted),
            DebugOutcome::Unidentifiable { .. } => Some(ErrorKind::DebugUnidentifiable),
            DebugOutcome::NoFix { .. } => Some(ErrorKind::DebugNoFix),
        }
    }

    pub fn reason(&self) -> String {
        match self {
            DebugOutcome::Fixed { attempts } => format!("tests pass after {attempts} fix(es)"),
            DebugOutcome::Exhausted { attempts } => {
                format!("tests still failing after {attempts} fix attempt(s)")
            }
            DebugOutcome::Unidentifiable { reason } | DebugOutcome::NoFix { reason, .. } => {
                reason.clone()
            }
        }
    }
}

/// Steps logged by one debug phase and how it ended.
#[derive(Debug, Clone, Serialize)]
pub struct DebugReport {
    pub steps: Vec<WorkflowStep>,
    pub outcome: DebugOutcome,
}

/// How a full run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    /// The commit phase ran. `success` is false when `git_commit` failed.
    Committed { success: bool, message: String },
    Abandoned {
        kind: Option<ErrorKind>,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub outcome: WorkflowOutcome,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowRun {
    pub fn labels(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.label.as_str()).collect()
    }
}

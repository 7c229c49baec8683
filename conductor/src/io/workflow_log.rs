//! Append-only NDJSON log of workflow steps (`workflow.log`).

use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::step::WorkflowStep;
use crate::io::exec_log::{open_append, read_ndjson};

pub const WORKFLOW_LOG_FILE: &str = "workflow.log";

#[derive(Debug)]
pub struct WorkflowLog {
    path: PathBuf,
    file: RefCell<Option<File>>,
}

impl WorkflowLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: RefCell::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, step: &WorkflowStep) -> Result<()> {
        let mut line = serde_json::to_string(step).context("serialize workflow step")?;
        line.push('\n');
        let mut slot = self.file.borrow_mut();
        if slot.is_none() {
            *slot = Some(open_append(&self.path)?);
        }
        if let Some(file) = slot.as_mut() {
            file.write_all(line.as_bytes())
                .with_context(|| format!("append {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn read_steps(&self) -> Result<Vec<WorkflowStep>> {
        read_ndjson(&self.path)
    }

    /// Replay the log into its sequence of step labels.
    pub fn labels(&self) -> Result<Vec<String>> {
        Ok(self.read_steps()?.into_iter().map(|s| s.label).collect())
    }
}

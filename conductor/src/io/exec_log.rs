//! Append-only audit log of dispatched actions (`tool_execution.log`).
//!
//! One JSON object per line: `{tool, args, result, timestamp}`. The result
//! is stored as its serialized text so the log never has to parse back
//! arbitrary payloads to stay append-only.

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::types::{Args, ToolResult};

pub const EXEC_LOG_FILE: &str = "tool_execution.log";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub tool: String,
    pub args: Args,
    pub result: String,
    pub timestamp: DateTime<Utc>,
}

/// Single-writer handle on the execution log.
#[derive(Debug)]
pub struct ExecutionLog {
    path: PathBuf,
    file: RefCell<Option<File>>,
}

impl ExecutionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: RefCell::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, tool: &str, args: &Args, result: &ToolResult) -> Result<()> {
        let entry = ExecutionLogEntry {
            tool: tool.to_string(),
            args: args.clone(),
            result: serde_json::to_string(result).context("serialize tool result")?,
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry).context("serialize log entry")?;
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

    /// Read every entry back. Lines that fail to parse are skipped with a warning.
    pub fn read_entries(&self) -> Result<Vec<ExecutionLogEntry>> {
        read_ndjson(&self.path)
    }
}

pub(crate) fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

pub(crate) fn read_ndjson<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut out = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => out.push(entry),
            Err(err) => warn!(line = idx + 1, err = %err, path = %path.display(), "skipping malformed log line"),
        }
    }
    Ok(out)
}

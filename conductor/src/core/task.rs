//! Task lifecycle and per-agent bookkeeping.
//!
//! A task starts `pending`, moves to `in_progress` once, and ends in exactly
//! one terminal state. Terminal tasks never re-enter a non-terminal state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// A unit of work submitted to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    /// Selects which handler interprets the task.
    pub task_type: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
}

impl Task {
    pub fn new(description: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            task_type: task_type.into(),
            context: Map::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn start(&mut self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Pending, TaskStatus::InProgress)
    }

    pub fn complete(&mut self, result: Value) -> Result<(), TaskError> {
        self.transition(TaskStatus::InProgress, TaskStatus::Completed)?;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TaskError> {
        self.transition(TaskStatus::InProgress, TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Fail with a classified error.
    pub fn fail_with(&mut self, kind: ErrorKind, error: impl Into<String>) -> Result<(), TaskError> {
        self.fail(error)?;
        self.error_kind = Some(kind);
        Ok(())
    }

    fn transition(&mut self, expected: TaskStatus, to: TaskStatus) -> Result<(), TaskError> {
        if self.status != expected {
            return Err(TaskError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Memory entry recorded for every successful task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub task_id: String,
    pub task: String,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Task history and memory owned by one agent.
#[derive(Debug, Default)]
pub struct TaskLedger {
    history: Vec<Task>,
    memory: Vec<MemoryEntry>,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finished task; completed ones also land in memory.
    pub fn record(&mut self, task: Task) {
        if task.status == TaskStatus::Completed {
            self.memory.push(MemoryEntry {
                task_id: task.id.clone(),
                task: task.description.clone(),
                result: task.result.clone().unwrap_or(Value::Null),
                timestamp: Utc::now(),
            });
        }
        self.history.push(task);
    }

    pub fn history(&self) -> &[Task] {
        &self.history
    }

    pub fn memory(&self) -> &[MemoryEntry] {
        &self.memory
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts {
            total: self.history.len(),
            ..StatusCounts::default()
        };
        for task in &self.history {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_moves_through_happy_path() {
        let mut task = Task::new("add two numbers", "general");
        assert_eq!(task.status, TaskStatus::Pending);

        task.start().expect("start");
        task.complete(json!({"answer": 3})).expect("complete");

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.result, Some(json!({"answer": 3})));
    }

    #[test]
    fn terminal_task_cannot_restart() {
        let mut task = Task::new("x", "general");
        task.start().expect("start");
        task.fail("boom").expect("fail");

        let err = task.start().unwrap_err();
        assert_eq!(
            err,
            TaskError::InvalidTransition {
                id: task.id.clone(),
                from: TaskStatus::Failed,
                to: TaskStatus::InProgress,
            }
        );
        assert!(task.complete(json!(null)).is_err());
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[test]
    fn pending_task_cannot_complete_directly() {
        let mut task = Task::new("x", "general");
        assert!(task.complete(json!(1)).is_err());
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn ledger_only_remembers_completed_tasks() {
        let mut ledger = TaskLedger::new();

        let mut ok = Task::new("ok", "general");
        ok.start().expect("start");
        ok.complete(json!("done")).expect("complete");
        let mut bad = Task::new("bad", "general");
        bad.start().expect("start");
        bad.fail("nope").expect("fail");

        ledger.record(ok.clone());
        ledger.record(bad);

        assert_eq!(ledger.history().len(), 2);
        assert_eq!(ledger.memory().len(), 1);
        assert_eq!(ledger.memory()[0].task_id, ok.id);
        let counts = ledger.status_counts();
        assert_eq!((counts.total, counts.completed, counts.failed), (2, 1, 1));
    }
}

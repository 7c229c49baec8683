//! Task bookkeeping around a handler: lifecycle, history and memory.

use anyhow::Result;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::agent::agent_loop::{AgentLoop, DEFAULT_MAX_STEPS, LoopOutcome};
use crate::core::task::{MemoryEntry, StatusCounts, Task, TaskLedger};
use crate::error::ErrorKind;
use crate::io::connector::ModelConnector;
use crate::io::prompt::PromptEngine;
use crate::tools::dispatcher::Dispatcher;
use crate::tools::registry::AccessMode;

/// A handler failure with a classification the caller can act on.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Task type for question-answering sessions; handled without mutating actions.
pub const CHAT_TASK_TYPE: &str = "chat";

/// Interprets submitted tasks. The task's `task_type` is the handler's to
/// route on.
pub trait TaskHandler {
    /// Work on `task`. `memory` holds results of earlier completed tasks.
    fn handle(&mut self, task: &Task, memory: &[MemoryEntry]) -> Result<Value>;
}

pub struct TaskRunner<H> {
    handler: H,
    ledger: TaskLedger,
}

impl<H: TaskHandler> TaskRunner<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            ledger: TaskLedger::new(),
        }
    }

    /// Run one task to a terminal state and record it.
    #[instrument(skip_all, fields(task_type = %task_type))]
    pub fn submit(
        &mut self,
        description: impl Into<String>,
        task_type: &str,
        context: Map<String, Value>,
    ) -> Result<Task> {
        let mut task = Task::new(description, task_type).with_context(context);
        task.start()?;
        match self.handler.handle(&task, self.ledger.memory()) {
            Ok(result) => {
                info!(task = %task.id, "task completed");
                task.complete(result)?;
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(task = %task.id, err = %message, "task failed");
                match err.downcast_ref::<TaskFailure>() {
                    Some(failure) => task.fail_with(failure.kind, message)?,
                    None => task.fail(message)?,
                }
            }
        }
        self.ledger.record(task.clone());
        Ok(task)
    }

    pub fn history(&self) -> &[Task] {
        self.ledger.history()
    }

    pub fn memory(&self) -> &[MemoryEntry] {
        self.ledger.memory()
    }

    pub fn status(&self) -> StatusCounts {
        self.ledger.status_counts()
    }
}

/// Handles a task by running the agent loop on its description.
pub struct ToolAgent<'a> {
    connector: &'a dyn ModelConnector,
    dispatcher: &'a Dispatcher<'a>,
    prompts: PromptEngine,
    max_steps: u32,
}

impl<'a> ToolAgent<'a> {
    pub fn new(connector: &'a dyn ModelConnector, dispatcher: &'a Dispatcher<'a>) -> Self {
        Self {
            connector,
            dispatcher,
            prompts: PromptEngine::new(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }
}

impl TaskHandler for ToolAgent<'_> {
    fn handle(&mut self, task: &Task, memory: &[MemoryEntry]) -> Result<Value> {
        // A chat task narrows the dispatcher; nothing widens it.
        let dispatcher = if task.task_type == CHAT_TASK_TYPE {
            self.dispatcher.with_mode(AccessMode::ReadOnly)
        } else {
            *self.dispatcher
        };
        let read_only = dispatcher.mode() == AccessMode::ReadOnly;
        let system = self.prompts.render_system(read_only, memory)?;
        let mut goal = task.description.clone();
        if !task.context.is_empty() {
            goal.push_str("\n\nContext:\n");
            goal.push_str(&serde_json::to_string_pretty(&task.context)?);
        }

        let outcome = AgentLoop::new(self.connector, &dispatcher, system, goal)
            .with_max_steps(self.max_steps)
            .run();
        match outcome {
            LoopOutcome::Final { answer, steps } => Ok(json!({"answer": answer, "steps": steps})),
            LoopOutcome::StepLimitReached { steps } => Err(TaskFailure {
                kind: ErrorKind::StepLimitReached,
                message: format!("no final answer after {steps} steps"),
            }
            .into()),
            LoopOutcome::ConnectorFailed { reason, .. } => {
                Err(anyhow::anyhow!("model connector failed: {reason}"))
            }
        }
    }
}

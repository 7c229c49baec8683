//! Test doubles for process execution and the model connector, plus a
//! throwaway project fixture.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Result, anyhow};

use crate::core::types::{Message, ModelTurn};
use crate::io::connector::{CompletionRequest, ModelConnector};
use crate::io::process::{CommandSpec, ProcessOutput, ProcessRunner};
use crate::runtime::Runtime;

/// Replays queued outputs instead of spawning processes.
///
/// `git` invocations draw from their own queue so tests can script the test
/// command without accounting for commits. An empty queue answers with a
/// successful run and no output.
#[derive(Default)]
pub struct ScriptedProcessRunner {
    outputs: RefCell<VecDeque<ProcessOutput>>,
    git_outputs: RefCell<VecDeque<ProcessOutput>>,
    calls: RefCell<Vec<CommandSpec>>,
}

impl ScriptedProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, output: ProcessOutput) {
        self.outputs.borrow_mut().push_back(output);
    }

    pub fn push_git(&self, output: ProcessOutput) {
        self.git_outputs.borrow_mut().push_back(output);
    }

    /// Every command seen so far, git included, in call order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    /// Non-git commands only.
    pub fn commands(&self) -> Vec<CommandSpec> {
        self.calls
            .borrow()
            .iter()
            .filter(|spec| spec.program != "git")
            .cloned()
            .collect()
    }
}

impl ProcessRunner for ScriptedProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        self.calls.borrow_mut().push(spec.clone());
        let queue = if spec.program == "git" {
            &self.git_outputs
        } else {
            &self.outputs
        };
        Ok(queue.borrow_mut().pop_front().unwrap_or_else(|| passed("")))
    }
}

/// Exit 0 with `stdout`.
pub fn passed(stdout: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        ..ProcessOutput::default()
    }
}

/// Non-zero exit with `stdout`.
pub fn failed(code: i32, stdout: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: Some(code),
        stdout: stdout.to_string(),
        ..ProcessOutput::default()
    }
}

/// What a [`ScriptedConnector`] was asked.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    /// Names of the advertised tools.
    pub tools: Vec<String>,
}

/// Connector that replays queued turns. Errors once the script runs out,
/// unless built with [`ScriptedConnector::repeating`].
#[derive(Default)]
pub struct ScriptedConnector {
    turns: RefCell<VecDeque<Result<ModelTurn, String>>>,
    repeat: Option<ModelTurn>,
    requests: RefCell<Vec<RecordedRequest>>,
}

impl ScriptedConnector {
    pub fn new(turns: impl IntoIterator<Item = ModelTurn>) -> Self {
        Self {
            turns: RefCell::new(turns.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    /// Answer every request with `turn`.
    pub fn repeating(turn: ModelTurn) -> Self {
        Self {
            repeat: Some(turn),
            ..Self::default()
        }
    }

    /// Queue plain-text replies.
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(replies.into_iter().map(ModelTurn::text))
    }

    pub fn push(&self, turn: ModelTurn) {
        self.turns.borrow_mut().push_back(Ok(turn));
    }

    pub fn push_error(&self, message: &str) {
        self.turns.borrow_mut().push_back(Err(message.to_string()));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.borrow().clone()
    }

    /// User prompts in request order.
    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .filter_map(|r| r.messages.last().and_then(|m| m.content.clone()))
            .collect()
    }
}

impl ModelConnector for ScriptedConnector {
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<ModelTurn> {
        self.requests.borrow_mut().push(RecordedRequest {
            messages: request.messages.to_vec(),
            tools: request.tools.iter().map(|t| t.name.clone()).collect(),
        });
        match self.turns.borrow_mut().pop_front() {
            Some(Ok(turn)) => Ok(turn),
            Some(Err(message)) => Err(anyhow!(message)),
            None => self
                .repeat
                .clone()
                .ok_or_else(|| anyhow!("scripted connector exhausted")),
        }
    }
}

/// Fence `code` the way a model reply would.
pub fn fenced(lang: &str, code: &str) -> String {
    format!("Here you go:\n```{lang}\n{code}\n```\n")
}

/// A runtime rooted in a fresh temp dir with a scripted process runner.
pub struct TestProject {
    pub temp: tempfile::TempDir,
    pub runner: Rc<ScriptedProcessRunner>,
    pub runtime: Runtime,
}

impl TestProject {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = Rc::new(ScriptedProcessRunner::new());
        let runtime = Runtime::open_with_runner(temp.path(), runner.clone()).expect("runtime");
        Self {
            temp,
            runner,
            runtime,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn write(&self, path: &str, content: &str) {
        self.runtime
            .workspace
            .write(path, content)
            .expect("write fixture file");
    }

    pub fn read(&self, path: &str) -> String {
        self.runtime.workspace.read(path).expect("read fixture file")
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

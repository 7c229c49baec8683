//! Bounded tool-calling loop.
//!
//! Each step sends the conversation plus the advertised actions to the
//! connector. A final answer ends the loop; requested actions are dispatched
//! in order and every result is appended as a tool message before the next
//! step. The loop never runs more than `max_steps` steps.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Message, ModelTurn, ToolCall, ToolResult, ToolSpec};
use crate::error::ErrorKind;
use crate::io::connector::{CompletionRequest, ModelConnector};
use crate::tools::dispatcher::Dispatcher;

pub const DEFAULT_MAX_STEPS: u32 = 10;

/// One dispatched call and what came back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub call: ToolCall,
    pub result: ToolResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutcome {
    Final { answer: String },
    Dispatched { calls: Vec<CallRecord> },
    ConnectorFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    /// 1-based.
    pub index: u32,
    pub outcome: StepOutcome,
}

/// How a loop ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoopOutcome {
    Final { answer: String, steps: u32 },
    StepLimitReached { steps: u32 },
    ConnectorFailed { reason: String, steps: u32 },
}

impl LoopOutcome {
    pub fn steps(&self) -> u32 {
        match self {
            LoopOutcome::Final { steps, .. }
            | LoopOutcome::StepLimitReached { steps }
            | LoopOutcome::ConnectorFailed { steps, .. } => *steps,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            LoopOutcome::StepLimitReached { .. } => Some(ErrorKind::StepLimitReached),
            _ => None,
        }
    }
}

pub struct AgentLoop<'a> {
    connector: &'a dyn ModelConnector,
    dispatcher: &'a Dispatcher<'a>,
    tools: Vec<ToolSpec>,
    messages: Vec<Message>,
    max_steps: u32,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        connector: &'a dyn ModelConnector,
        dispatcher: &'a Dispatcher<'a>,
        system_prompt: impl Into<String>,
        goal: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            dispatcher,
            tools: dispatcher.advertised(),
            messages: vec![Message::system(system_prompt), Message::user(goal)],
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Iterate over steps. Yields at most `max_steps` records and stops after
    /// a final answer or a connector failure.
    pub fn steps(&mut self) -> Steps<'_, 'a> {
        Steps {
            agent: self,
            taken: 0,
            finished: false,
        }
    }

    /// Drive the loop to an outcome.
    #[instrument(skip_all, fields(max_steps = self.max_steps))]
    pub fn run(&mut self) -> LoopOutcome {
        let mut last = None;
        let mut taken = 0;
        for record in self.steps() {
            taken = record.index;
            last = Some(record.outcome);
        }
        match last {
            Some(StepOutcome::Final { answer }) => {
                info!(steps = taken, "agent produced final answer");
                LoopOutcome::Final {
                    answer,
                    steps: taken,
                }
            }
            Some(StepOutcome::ConnectorFailed { reason }) => LoopOutcome::ConnectorFailed {
                reason,
                steps: taken,
            },
            Some(StepOutcome::Dispatched { .. }) | None => {
                warn!(steps = taken, "step limit reached without a final answer");
                LoopOutcome::StepLimitReached { steps: taken }
            }
        }
    }

    fn step(&mut self) -> StepOutcome {
        let request = CompletionRequest {
            messages: &self.messages,
            tools: &self.tools,
        };
        let turn = match self.connector.complete(&request) {
            Ok(turn) => turn,
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(err = %reason, "connector failed");
                return StepOutcome::ConnectorFailed { reason };
            }
        };

        let (content, calls) = match turn {
            ModelTurn::Final { content } => {
                self.messages.push(Message::assistant(Some(content.clone()), Vec::new()));
                return StepOutcome::Final { answer: content };
            }
            // An empty batch is the connector's way of saying it is done.
            ModelTurn::ToolCalls { content, calls } if calls.is_empty() => {
                let answer = content.unwrap_or_default();
                self.messages.push(Message::assistant(Some(answer.clone()), Vec::new()));
                return StepOutcome::Final { answer };
            }
            ModelTurn::ToolCalls { content, calls } => (content, calls),
        };

        self.messages.push(Message::assistant(content, calls.clone()));
        let mut records = Vec::with_capacity(calls.len());
        for call in calls {
            debug!(tool = %call.name, id = %call.id, "dispatching requested call");
            let result = self.dispatcher.dispatch_call(&call);
            self.messages
                .push(Message::tool(&call, result.to_message_content()));
            records.push(CallRecord { call, result });
        }
        StepOutcome::Dispatched { calls: records }
    }
}

/// Bounded step iterator returned by [`AgentLoop::steps`].
pub struct Steps<'l, 'a> {
    agent: &'l mut AgentLoop<'a>,
    taken: u32,
    finished: bool,
}

impl Iterator for Steps<'_, '_> {
    type Item = StepRecord;

    fn next(&mut self) -> Option<StepRecord> {
        if self.finished || self.taken >= self.agent.max_steps {
            return None;
        }
        self.taken += 1;
        let outcome = self.agent.step();
        if !matches!(outcome, StepOutcome::Dispatched { .. }) {
            self.finished = true;
        }
        Some(StepRecord {
            index: self.taken,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Args, Role};
    use crate::hooks::{HookEngine, HookMap};
    use crate::io::exec_log::ExecutionLog;
    use crate::test_support::ScriptedConnector;
    use crate::tools::registry::{AccessMode, ToolRegistry};
    use anyhow::Result;
    use serde_json::{Value, json};

    fn read_call(id: &str) -> ToolCall {
        ToolCall::new(id, "read_file", r#"{"path": "a.py"}"#)
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolSpec {
                name: "read_file".to_string(),
                description: String::new(),
                parameters: json!({"type": "object"}),
                mutating: false,
            },
            |_: &Args| -> Result<Value> { Ok(json!({"content": "x = 1\n"})) },
        );
        registry
    }

    #[test]
    fn stops_with_step_limit_after_n_steps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry();
        let hooks = HookEngine::with_map(temp.path().join("h.json"), HookMap::new());
        let log = ExecutionLog::new(temp.path().join("log"));
        let dispatcher = Dispatcher::new(&registry, &hooks, &log);
        let connector = ScriptedConnector::repeating(ModelTurn::calls(vec![read_call("c")]));

        let mut agent = AgentLoop::new(&connector, &dispatcher, "sys", "goal").with_max_steps(3);
        let outcome = agent.run();

        assert_eq!(outcome, LoopOutcome::StepLimitReached { steps: 3 });
        assert_eq!(outcome.error_kind(), Some(ErrorKind::StepLimitReached));
        assert_eq!(connector.requests().len(), 3);
        assert_eq!(log.read_entries().expect("log").len(), 3);
    }

    #[test]
    fn final_answer_ends_loop_and_results_are_correlated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry();
        let hooks = HookEngine::with_map(temp.path().join("h.json"), HookMap::new());
        let log = ExecutionLog::new(temp.path().join("log"));
        let dispatcher = Dispatcher::new(&registry, &hooks, &log);
        let connector = ScriptedConnector::new([
            ModelTurn::calls(vec![read_call("c1"), ToolCall::new("c2", "nope", "{}")]),
            ModelTurn::text("done"),
        ]);

        let mut agent = AgentLoop::new(&connector, &dispatcher, "sys", "goal");
        let outcome = agent.run();
        assert_eq!(
            outcome,
            LoopOutcome::Final {
                answer: "done".to_string(),
                steps: 2
            }
        );

        let tool_messages: Vec<&Message> = agent
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_messages.len(), 2);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("c1"));
        let second: Value =
            serde_json::from_str(tool_messages[1].content.as_deref().expect("content"))
                .expect("json");
        assert_eq!(second["success"], false);
        assert_eq!(second["error"]["kind"], "ToolNotFound");
    }

    #[test]
    fn iterator_yields_each_step() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry();
        let hooks = HookEngine::with_map(temp.path().join("h.json"), HookMap::new());
        let log = ExecutionLog::new(temp.path().join("log"));
        let dispatcher = Dispatcher::new(&registry, &hooks, &log);
        let connector = ScriptedConnector::new([
            ModelTurn::calls(vec![read_call("c1")]),
            ModelTurn::text("ok"),
            ModelTurn::text("never requested"),
        ]);

        let mut agent = AgentLoop::new(&connector, &dispatcher, "sys", "goal");
        let records: Vec<StepRecord> = agent.steps().collect();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].outcome, StepOutcome::Dispatched { ref calls } if calls.len() == 1));
        assert_eq!(connector.requests().len(), 2);
    }

    #[test]
    fn connector_error_ends_loop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry();
        let hooks = HookEngine::with_map(temp.path().join("h.json"), HookMap::new());
        let log = ExecutionLog::new(temp.path().join("log"));
        let dispatcher = Dispatcher::new(&registry, &hooks, &log);
        let connector = ScriptedConnector::default();
        connector.push_error("model offline");

        let outcome = AgentLoop::new(&connector, &dispatcher, "sys", "goal").run();
        assert!(matches!(
            outcome,
            LoopOutcome::ConnectorFailed { steps: 1, ref reason } if reason.contains("model offline")
        ));
    }

    #[test]
    fn read_only_loop_advertises_only_safe_tools() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut registry = registry();
        registry.register(
            ToolSpec {
                name: "write_file".to_string(),
                description: String::new(),
                parameters: json!({"type": "object"}),
                mutating: true,
            },
            |_: &Args| -> Result<Value> { Ok(json!(null)) },
        );
        let hooks = HookEngine::with_map(temp.path().join("h.json"), HookMap::new());
        let log = ExecutionLog::new(temp.path().join("log"));
        let dispatcher =
            Dispatcher::new(&registry, &hooks, &log).with_mode(AccessMode::ReadOnly);
        let connector = ScriptedConnector::new([
            ModelTurn::calls(vec![ToolCall::new("w", "write_file", "{}")]),
            ModelTurn::text("gave up"),
        ]);

        let mut agent = AgentLoop::new(&connector, &dispatcher, "sys", "goal");
        agent.run();

        let advertised = &connector.requests()[0].tools;
        assert_eq!(advertised, &vec!["read_file".to_string()]);
        let entries = log.read_entries().expect("log");
        let stored: ToolResult = serde_json::from_str(&entries[0].result).expect("json");
        assert_eq!(stored.error_kind(), Some(ErrorKind::ToolNotFound));
    }
}

//! Model connector abstraction.
//!
//! The [`ModelConnector`] trait decouples the agent loop and the workflow from
//! the model backend. The shipped backend is an external command that speaks
//! JSON over stdin/stdout; tests use a scripted connector instead.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::parse::{Parsed, parse_structured};
use crate::core::types::{Message, ModelTurn, ToolSpec};
use crate::io::process::{CommandSpec, ProcessRunner};

/// One round-trip to the model: the conversation plus the advertised actions.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CompletionRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
}

pub trait ModelConnector {
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<ModelTurn>;
}

/// Ask for plain text: a system prompt, one user prompt, no actions.
///
/// A tool-call turn with accompanying text is accepted; one without text is
/// treated as an empty answer.
pub fn complete_text(connector: &dyn ModelConnector, system: &str, prompt: &str) -> Result<String> {
    let messages = [Message::system(system), Message::user(prompt)];
    let turn = connector.complete(&CompletionRequest {
        messages: &messages,
        tools: &[],
    })?;
    Ok(match turn {
        ModelTurn::Final { content } => content,
        ModelTurn::ToolCalls { content, calls } => {
            warn!(calls = calls.len(), "connector requested actions for a text-only prompt");
            content.unwrap_or_default()
        }
    })
}

/// Connector that spawns a configured command per request.
pub struct CommandConnector {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    runner: Rc<dyn ProcessRunner>,
}

impl CommandConnector {
    pub fn new(
        command: Vec<String>,
        workdir: impl Into<PathBuf>,
        runner: Rc<dyn ProcessRunner>,
    ) -> Result<Self> {
        if command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(anyhow!(
                "connector.command is not configured (set it in .conductor/config.toml)"
            ));
        }
        Ok(Self {
            command,
            workdir: workdir.into(),
            timeout: Duration::from_secs(300),
            output_limit_bytes: 1_000_000,
            runner,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }
}

impl ModelConnector for CommandConnector {
    #[instrument(skip_all, fields(messages = request.messages.len(), tools = request.tools.len()))]
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<ModelTurn> {
        let payload = serde_json::to_vec(request).context("serialize completion request")?;
        let spec = CommandSpec::from_argv(&self.command, &self.workdir)?
            .stdin(payload)
            .timeout(self.timeout)
            .output_limit(self.output_limit_bytes);
        info!(command = %spec.display(), "calling model connector");
        let output = self.runner.run(&spec).context("run model connector")?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "connector timed out");
            return Err(anyhow!("model connector timed out after {:?}", self.timeout));
        }
        if !output.success() {
            warn!(exit_code = ?output.exit_code, "connector failed");
            return Err(anyhow!(
                "model connector failed with status {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            ));
        }
        decode_turn(&output.stdout)
    }
}

/// Decode connector stdout. Anything that is not a turn object is taken as a
/// final answer.
pub fn decode_turn(stdout: &str) -> Result<ModelTurn> {
    match parse_structured::<ModelTurn>(stdout) {
        Parsed::Strict(turn) => Ok(turn),
        Parsed::Extracted(turn) => {
            debug!("connector turn recovered from surrounding text");
            Ok(turn)
        }
        Parsed::Raw(text) if text.is_empty() => Err(anyhow!("model connector produced no output")),
        Parsed::Raw(text) => {
            debug!("connector output is not a turn object, using it as final text");
            Ok(ModelTurn::Final { content: text })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::process::ProcessOutput;
    use crate::test_support::ScriptedProcessRunner;

    #[test]
    fn decodes_tagged_turns_and_falls_back_to_text() {
        let turn = decode_turn(r#"{"type":"final","content":"done"}"#).expect("decode");
        assert_eq!(turn, ModelTurn::text("done"));

        let turn = decode_turn("just some prose\n").expect("decode");
        assert_eq!(turn, ModelTurn::text("just some prose"));

        assert!(decode_turn("  \n").is_err());
    }

    #[test]
    fn decodes_object_arguments() {
        let turn = decode_turn(
            r#"{"type":"tool_calls","calls":[{"id":"c1","name":"read_file","arguments":{"path":"a.py"}}]}"#,
        )
        .expect("decode");
        let ModelTurn::ToolCalls { calls, .. } = turn else {
            panic!("expected tool calls");
        };
        assert_eq!(calls[0].parse_arguments().expect("args")["path"], "a.py");
    }

    #[test]
    fn bad_entry_does_not_turn_batch_into_text() {
        let turn = decode_turn(
            r#"{"type":"tool_calls","calls":[
                {"id":"c1","name":"read_file","arguments":{"path":"a.py"}},
                {"name":"read_file","arguments":{"path":"b.py"}}
            ]}"#,
        )
        .expect("decode");
        let ModelTurn::ToolCalls { calls, .. } = turn else {
            panic!("expected tool calls");
        };
        assert_eq!(calls.len(), 2);
        assert!(calls[0].malformed.is_none());
        assert!(calls[1].malformed.is_some());
    }

    #[test]
    fn unconfigured_command_is_rejected() {
        let runner = Rc::new(ScriptedProcessRunner::new());
        assert!(CommandConnector::new(Vec::new(), ".", runner).is_err());
    }

    #[test]
    fn sends_request_on_stdin() {
        let runner = Rc::new(ScriptedProcessRunner::new());
        runner.push(ProcessOutput {
            exit_code: Some(0),
            stdout: r#"{"type":"tool_calls","calls":[{"id":"1","name":"read_file","arguments":"{}"}]}"#
                .to_string(),
            ..ProcessOutput::default()
        });
        let connector =
            CommandConnector::new(vec!["model-bridge".to_string()], "/work", runner.clone())
                .expect("connector");

        let messages = [Message::user("hi")];
        let turn = connector
            .complete(&CompletionRequest {
                messages: &messages,
                tools: &[],
            })
            .expect("complete");
        assert!(matches!(turn, ModelTurn::ToolCalls { ref calls, .. } if calls.len() == 1));

        let calls = runner.calls();
        let stdin = calls[0].stdin.clone().expect("stdin");
        let sent: serde_json::Value = serde_json::from_slice(&stdin).expect("json");
        assert_eq!(sent["messages"][0]["role"], "user");
    }

    #[test]
    fn failing_command_is_an_error() {
        let runner = Rc::new(ScriptedProcessRunner::new());
        runner.push(ProcessOutput {
            exit_code: Some(2),
            stderr: "no api key".to_string(),
            ..ProcessOutput::default()
        });
        let connector =
            CommandConnector::new(vec!["model-bridge".to_string()], "/work", runner)
                .expect("connector");
        let err = connector
            .complete(&CompletionRequest {
                messages: &[],
                tools: &[],
            })
            .unwrap_err();
        assert!(err.to_string().contains("no api key"));
    }
}

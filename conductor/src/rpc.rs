//! JSON-RPC 2.0 surface over stdio, one request per line.
//!
//! Methods:
//! - `tools.list`: advertised action specs.
//! - `tool.<name>`: dispatch one action with `params` as its arguments.
//! - `workflow.<phase>`: run one workflow phase (`plan`, `code_gen`, `test`,
//!   `debug`, `commit`, `run`) or read the saved `state`. State is persisted
//!   between calls so phases can be driven one at a time.

use std::io::{BufRead, Write};

use anyhow::{Context, Error, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::types::{Args, ModelTurn};
use crate::io::connector::{CompletionRequest, ModelConnector};
use crate::io::lint::LinterSet;
use crate::runtime::Runtime;
use crate::tools::dispatcher::Dispatcher;
use crate::tools::registry::AccessMode;
use crate::workflow::{Workflow, WorkflowState, load_state, save_state};

pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON is not a valid request object.
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    /// Internal error carrying the full chain as diagnostic data.
    pub fn internal(err: &Error) -> Self {
        Self {
            code: error_codes::INTERNAL_ERROR,
            message: format!("Internal error: {err:#}"),
            data: Some(Value::String(format!("{err:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Stands in when no connector is configured; phases that need the model
/// fail with a clear message while `test` and `commit` still work.
struct Unconfigured;

impl ModelConnector for Unconfigured {
    fn complete(&self, _request: &CompletionRequest<'_>) -> Result<ModelTurn> {
        Err(anyhow!(
            "model connector not configured; set connector.command in the config"
        ))
    }
}

static UNCONFIGURED: Unconfigured = Unconfigured;

#[derive(Deserialize)]
struct GoalParams {
    goal: String,
}

#[derive(Deserialize, Default)]
struct CommitParams {
    #[serde(default)]
    message: Option<String>,
}

pub struct RpcServer<'a> {
    runtime: &'a Runtime,
    dispatcher: Dispatcher<'a>,
    connector: Option<&'a dyn ModelConnector>,
    linters: LinterSet,
}

impl<'a> RpcServer<'a> {
    pub fn new(runtime: &'a Runtime, connector: Option<&'a dyn ModelConnector>) -> Self {
        Self {
            runtime,
            dispatcher: runtime.dispatcher(AccessMode::Full),
            connector,
            linters: runtime.linters(),
        }
    }

    /// Answer one line. Blank lines get no response.
    pub fn handle_line(&self, line: &str) -> Option<RpcResponse> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                return Some(RpcResponse::failure(
                    Value::Null,
                    RpcError::new(error_codes::PARSE_ERROR, format!("Parse error: {err}")),
                ));
            }
        };
        Some(self.handle_value(value))
    }

    pub fn handle_value(&self, value: Value) -> RpcResponse {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<RpcRequest>(value) {
            Ok(request) => self.handle(&request),
            Err(err) => RpcResponse::failure(
                id,
                RpcError::new(error_codes::INVALID_REQUEST, format!("Invalid Request: {err}")),
            ),
        }
    }

    #[instrument(skip_all, fields(method = %request.method))]
    pub fn handle(&self, request: &RpcRequest) -> RpcResponse {
        if let Some(version) = &request.jsonrpc
            && version != "2.0"
        {
            return RpcResponse::failure(
                request.id.clone(),
                RpcError::new(
                    error_codes::INVALID_REQUEST,
                    format!("Invalid Request: unsupported jsonrpc version {version}"),
                ),
            );
        }
        match self.route(&request.method, &request.params) {
            Ok(result) => RpcResponse::success(request.id.clone(), result),
            Err(error) => {
                debug!(code = error.code, message = %error.message, "request failed");
                RpcResponse::failure(request.id.clone(), error)
            }
        }
    }

    fn route(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        if method == "tools.list" {
            return to_value(&self.dispatcher.advertised());
        }
        if let Some(name) = method.strip_prefix("tool.") {
            let args = object_params(params)?;
            return to_value(&self.dispatcher.dispatch(name, &args));
        }
        if let Some(phase) = method.strip_prefix("workflow.") {
            return self.workflow_phase(method, phase, params);
        }
        Err(RpcError::method_not_found(method))
    }

    fn workflow_phase(&self, method: &str, phase: &str, params: &Value) -> Result<Value, RpcError> {
        if !matches!(
            phase,
            "plan" | "code_gen" | "test" | "debug" | "commit" | "run" | "state"
        ) {
            return Err(RpcError::method_not_found(method));
        }
        let state_path = self.runtime.workflow_state_path();
        let state = load_state(&state_path).map_err(|err| RpcError::internal(&err))?;
        if phase == "state" {
            return to_value(&state);
        }

        let connector = self.connector.unwrap_or(&UNCONFIGURED);
        let mut workflow = Workflow::new(self.runtime, connector, &self.dispatcher, &self.linters)
            .with_state(state);
        let result = match phase {
            "plan" => {
                let params: GoalParams = parse_params(params)?;
                workflow.plan(&params.goal).and_then(|step| to_json(&step))
            }
            "code_gen" => workflow.code_gen().and_then(|step| to_json(&step)),
            "test" => workflow.test().and_then(|step| to_json(&step)),
            "debug" => workflow.debug().and_then(|report| to_json(&report)),
            "commit" => {
                let params: CommitParams = if params.is_null() {
                    CommitParams::default()
                } else {
                    parse_params(params)?
                };
                workflow
                    .commit(params.message.as_deref())
                    .and_then(|step| to_json(&step))
            }
            _ => {
                let params: GoalParams = parse_params(params)?;
                workflow.run(&params.goal).and_then(|run| to_json(&run))
            }
        };
        persist(&state_path, workflow.into_state());
        result.map_err(|err| RpcError::internal(&err))
    }

    /// Serve requests from `input` until EOF, one response line per request.
    pub fn serve<R: BufRead, W: Write>(&self, input: R, mut output: W) -> Result<()> {
        for line in input.lines() {
            let line = line.context("read request line")?;
            let Some(response) = self.handle_line(&line) else {
                continue;
            };
            let mut buf = serde_json::to_string(&response).context("serialize response")?;
            buf.push('\n');
            output
                .write_all(buf.as_bytes())
                .context("write response")?;
            output.flush().context("flush response")?;
        }
        Ok(())
    }
}

fn persist(path: &std::path::Path, state: WorkflowState) {
    if let Err(err) = save_state(path, &state) {
        warn!(path = %path.display(), err = %format!("{err:#}"), "workflow state not saved");
    }
}

fn object_params(params: &Value) -> Result<Args, RpcError> {
    match params {
        Value::Null => Ok(Args::new()),
        Value::Object(map) => Ok(map.clone()),
        other => Err(RpcError::invalid_params(format!(
            "params must be an object, got {other}"
        ))),
    }
}

fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, RpcError> {
    serde_json::from_value(params.clone())
        .map_err(|err| RpcError::invalid_params(format!("Invalid params: {err}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("serialize result")
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    to_json(value).map_err(|err| RpcError::internal(&err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedConnector, TestProject, failed};

    fn call(server: &RpcServer<'_>, request: Value) -> RpcResponse {
        server.handle_line(&request.to_string()).expect("response")
    }

    #[test]
    fn dispatches_tool_methods() {
        let project = TestProject::new();
        project.write("a.py", "x = 1\n");
        let server = RpcServer::new(&project.runtime, None);

        let response = call(
            &server,
            json!({"jsonrpc": "2.0", "method": "tool.read_file", "params": {"path": "a.py"}, "id": 7}),
        );
        assert_eq!(response.id, json!(7));
        let result = response.result.expect("result");
        assert_eq!(result["success"], true);
        assert_eq!(result["result"]["content"], "x = 1\n");
    }

    #[test]
    fn unknown_tool_is_a_result_not_an_rpc_error() {
        let project = TestProject::new();
        let server = RpcServer::new(&project.runtime, None);
        let response = call(&server, json!({"method": "tool.nope", "id": 1}));
        let result = response.result.expect("result");
        assert_eq!(result["success"], false);
        assert_eq!(result["error"]["kind"], "ToolNotFound");
    }

    #[test]
    fn error_codes_for_bad_requests() {
        let project = TestProject::new();
        let server = RpcServer::new(&project.runtime, None);

        let parse = server.handle_line("{not json").expect("response");
        assert_eq!(parse.error.expect("error").code, error_codes::PARSE_ERROR);
        assert_eq!(parse.id, Value::Null);

        let invalid = call(&server, json!({"params": {}, "id": 2}));
        assert_eq!(invalid.error.expect("error").code, error_codes::INVALID_REQUEST);

        let missing = call(&server, json!({"method": "shell.exec", "id": 3}));
        assert_eq!(missing.error.expect("error").code, error_codes::METHOD_NOT_FOUND);

        let phase = call(&server, json!({"method": "workflow.deploy", "id": 4}));
        assert_eq!(phase.error.expect("error").code, error_codes::METHOD_NOT_FOUND);

        let params = call(&server, json!({"method": "tool.read_file", "params": [1], "id": 5}));
        assert_eq!(params.error.expect("error").code, error_codes::INVALID_PARAMS);

        assert!(server.handle_line("   ").is_none());
    }

    #[test]
    fn handler_failure_is_internal_error_with_data() {
        let project = TestProject::new();
        let server = RpcServer::new(&project.runtime, None);
        let response = call(&server, json!({"method": "workflow.code_gen", "id": 9}));
        let error = response.error.expect("error");
        assert_eq!(error.code, error_codes::INTERNAL_ERROR);
        assert!(error.message.contains("no plan"));
        assert!(error.data.is_some());
    }

    #[test]
    fn workflow_phases_share_persisted_state() {
        let project = TestProject::new();
        project
            .runner
            .push(failed(1, "FAILED tests/test_calc.py::test_add"));
        let connector =
            ScriptedConnector::replies([r#"{"files": [{"path": "src/calc.py"}]}"#]);
        let server = RpcServer::new(&project.runtime, Some(&connector as &dyn ModelConnector));

        let plan = call(
            &server,
            json!({"method": "workflow.plan", "params": {"goal": "calc"}, "id": 1}),
        );
        assert_eq!(plan.result.expect("result")["label"], "plan");
        let test = call(&server, json!({"method": "workflow.test", "id": 2}));
        assert_eq!(test.result.expect("result")["label"], "test:failure");

        let state = call(&server, json!({"method": "workflow.state", "id": 3}));
        let state = state.result.expect("result");
        assert_eq!(state["goal"], "calc");
        assert_eq!(state["last_test"]["passed"], false);
        assert_eq!(state["phase"], "test");
    }

    #[test]
    fn serve_answers_each_line() {
        let project = TestProject::new();
        let server = RpcServer::new(&project.runtime, None);
        let input = "{\"method\": \"tools.list\", \"id\": 1}\n\n{\"method\": \"x\", \"id\": 2}\n";
        let mut output = Vec::new();
        server.serve(input.as_bytes(), &mut output).expect("serve");

        let lines: Vec<RpcResponse> = String::from_utf8(output)
            .expect("utf8")
            .lines()
            .map(|l| serde_json::from_str(l).expect("response json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0].result.as_ref().and_then(Value::as_array).map(Vec::len),
            Some(11)
        );
        assert_eq!(lines[1].error.as_ref().map(|e| e.code), Some(error_codes::METHOD_NOT_FOUND));
    }
}

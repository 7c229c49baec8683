//! Shared contracts between the model connector, the dispatcher and the loop.
//!
//! Everything here is plain data: serializable, comparable, free of I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{ArgumentsError, ErrorKind};

/// Argument mapping passed to a tool.
pub type Args = Map<String, Value>;

/// Advertised description of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the argument object.
    pub parameters: Value,
    /// Whether the action writes files or runs processes.
    #[serde(default)]
    pub mutating: bool,
}

/// A single action requested by the model connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id supplied by the connector.
    pub id: String,
    pub name: String,
    /// Raw JSON text of the argument object. Connectors may send either an
    /// encoded string or the object itself.
    #[serde(default, deserialize_with = "arguments_text")]
    pub arguments: String,
    /// Set when the connector's entry for this call could not be decoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malformed: Option<String>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            malformed: None,
        }
    }

    /// Placeholder for the `index`-th batch entry that failed to decode.
    /// Keeps whatever id and name it had so the result can still be correlated.
    fn undecodable(index: usize, raw: &Value, err: &serde_json::Error) -> Self {
        let field = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            id: field("id").unwrap_or_else(|| format!("call-{index}")),
            name: field("name").unwrap_or_default(),
            arguments: raw.to_string(),
            malformed: Some(format!("undecodable tool call: {err}")),
        }
    }

    /// Parse the raw arguments into an object. Blank input means no arguments.
    pub fn parse_arguments(&self) -> Result<Args, ArgumentsError> {
        if let Some(reason) = &self.malformed {
            return Err(ArgumentsError::Malformed(reason.clone()));
        }
        let raw = self.arguments.trim();
        if raw.is_empty() {
            return Ok(Args::new());
        }
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Args::new()),
            Value::Array(_) => Err(ArgumentsError::NotAnObject("array")),
            Value::String(_) => Err(ArgumentsError::NotAnObject("string")),
            Value::Number(_) => Err(ArgumentsError::NotAnObject("number")),
            Value::Bool(_) => Err(ArgumentsError::NotAnObject("boolean")),
        }
    }
}

fn arguments_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(raw) => raw,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Decode a call batch entry by entry, so one bad entry does not sink the rest.
fn lenient_calls<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<ToolCall>, D::Error> {
    let entries = Vec::<Value>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            ToolCall::deserialize(&raw).unwrap_or_else(|err| ToolCall::undecodable(index, &raw, &err))
        })
        .collect())
}

/// Structured description of why an action failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Full error chain (or panic location) for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    /// Payload the tool attached to its failure (e.g. captured process output).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outcome of one follow-up hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookReport {
    pub hook: String,
    pub outcome: ToolResult,
}

/// Outcome of dispatching one action. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<ToolFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookReport>,
    pub timestamp: DateTime<Utc>,
}

impl ToolResult {
    pub fn ok(tool: impl Into<String>, result: Value) -> Self {
        Self {
            tool: tool.into(),
            success: true,
            result,
            error: None,
            hooks: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn failed(tool: impl Into<String>, failure: ToolFailure) -> Self {
        Self {
            tool: tool.into(),
            success: false,
            result: Value::Null,
            error: Some(failure),
            hooks: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_hooks(mut self, hooks: Vec<HookReport>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|err| err.kind)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|err| err.message.as_str())
    }

    /// Hook outcomes that did not succeed.
    pub fn failed_hooks(&self) -> impl Iterator<Item = &HookReport> {
        self.hooks.iter().filter(|h| !h.outcome.success)
    }

    /// Compact `{success, result, error}` rendering fed back to the model.
    pub fn to_message_content(&self) -> String {
        let error = self.error.as_ref().map(|err| {
            serde_json::json!({
                "kind": err.kind,
                "message": err.message,
            })
        });
        let mut body = serde_json::json!({
            "success": self.success,
            "result": self.result,
            "error": error,
        });
        if !self.hooks.is_empty() {
            let hooks: Vec<Value> = self
                .hooks
                .iter()
                .map(|h| {
                    serde_json::json!({
                        "hook": h.hook,
                        "success": h.outcome.success,
                        "error": h.outcome.error_message(),
                    })
                })
                .collect();
            body["hooks"] = Value::Array(hooks);
        }
        body.to_string()
    }
}

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One role-tagged conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
        }
    }
}

/// What the connector returned for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelTurn {
    Final {
        content: String,
    },
    ToolCalls {
        #[serde(default)]
        content: Option<String>,
        #[serde(deserialize_with = "lenient_calls")]
        calls: Vec<ToolCall>,
    },
}

impl ModelTurn {
    pub fn text(content: impl Into<String>) -> Self {
        ModelTurn::Final {
            content: content.into(),
        }
    }

    pub fn calls(calls: Vec<ToolCall>) -> Self {
        ModelTurn::ToolCalls {
            content: None,
            calls,
        }
    }
}

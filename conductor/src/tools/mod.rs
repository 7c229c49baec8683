//! Named actions the model can request: the registry, the dispatcher and the
//! built-in set.
//!
//! A tool is anything implementing [`Tool`]: it receives the parsed argument
//! object and returns a JSON payload or an error. The dispatcher is the only
//! caller, and it folds every outcome into a [`ToolResult`](crate::core::types::ToolResult).

pub mod builtin;
pub mod dispatcher;
pub mod registry;

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;

use crate::core::types::Args;
use crate::error::ArgumentError;

pub trait Tool {
    fn call(&self, args: &Args) -> Result<Value>;
}

impl<F> Tool for F
where
    F: Fn(&Args) -> Result<Value>,
{
    fn call(&self, args: &Args) -> Result<Value> {
        self(args)
    }
}

/// A process ran but reported failure. `output` is attached to the failed
/// result so callers can inspect what the process printed.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CommandFailed {
    pub message: String,
    pub output: Value,
}

pub fn required_str<'a>(args: &'a Args, name: &str) -> Result<&'a str, ArgumentError> {
    match args.get(name) {
        None | Some(Value::Null) => Err(ArgumentError::Missing(name.to_string())),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(ArgumentError::WrongType {
            name: name.to_string(),
            expected: "a string",
        }),
    }
}

pub fn optional_str<'a>(args: &'a Args, name: &str) -> Result<Option<&'a str>, ArgumentError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ArgumentError::WrongType {
            name: name.to_string(),
            expected: "a string",
        }),
    }
}

/// Accepts integers and integer-valued strings (`"3"`); models send both.
pub fn required_u64(args: &Args, name: &str) -> Result<u64, ArgumentError> {
    let wrong = || ArgumentError::WrongType {
        name: name.to_string(),
        expected: "a non-negative integer",
    };
    match args.get(name) {
        None | Some(Value::Null) => Err(ArgumentError::Missing(name.to_string())),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(wrong),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| wrong()),
        Some(_) => Err(wrong()),
    }
}

//! Invoke a named tool, record it, and run its hooks.
//!
//! `dispatch` never returns an error and never lets a panic escape: every
//! outcome is a [`ToolResult`]. A hook failure is reported inside the result
//! and never changes the primary action's success flag.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use anyhow::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Args, HookReport, ToolCall, ToolFailure, ToolResult, ToolSpec};
use crate::error::{ArgumentError, ErrorKind};
use crate::hooks::HookEngine;
use crate::io::exec_log::ExecutionLog;
use crate::tools::CommandFailed;
use crate::tools::registry::{AccessMode, ToolRegistry};

pub const DEFAULT_MAX_HOOK_DEPTH: u32 = 2;

#[derive(Clone, Copy)]
pub struct Dispatcher<'a> {
    registry: &'a ToolRegistry,
    hooks: &'a HookEngine,
    log: &'a ExecutionLog,
    mode: AccessMode,
    max_hook_depth: u32,
}

impl<'a> Dispatcher<'a> {
    pub fn new(registry: &'a ToolRegistry, hooks: &'a HookEngine, log: &'a ExecutionLog) -> Self {
        Self {
            registry,
            hooks,
            log,
            mode: AccessMode::Full,
            max_hook_depth: DEFAULT_MAX_HOOK_DEPTH,
        }
    }

    pub fn with_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_hook_depth(mut self, depth: u32) -> Self {
        self.max_hook_depth = depth;
        self
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Tool specs visible in this dispatcher's mode.
    pub fn advertised(&self) -> Vec<ToolSpec> {
        self.registry.advertised(self.mode)
    }

    #[instrument(skip_all, fields(tool = %name))]
    pub fn dispatch(&self, name: &str, args: &Args) -> ToolResult {
        let mut chain = Vec::new();
        self.dispatch_chain(name, args, &mut chain)
    }

    /// Dispatch a model-requested call whose arguments are still raw JSON.
    ///
    /// A call the connector sent in undecodable form is a `ParseError`
    /// whatever its name.
    pub fn dispatch_call(&self, call: &ToolCall) -> ToolResult {
        if call.malformed.is_none() && self.registry.resolve_in(&call.name, self.mode).is_none() {
            let result = not_found(&call.name);
            self.record(&call.name, &Args::new(), &result);
            return result;
        }
        match call.parse_arguments() {
            Ok(args) => self.dispatch(&call.name, &args),
            Err(err) => {
                warn!(tool = %call.name, err = %err, "unparseable tool arguments");
                let result = ToolResult::failed(
                    &call.name,
                    ToolFailure {
                        kind: ErrorKind::ParseError,
                        message: err.to_string(),
                        trace: Some(call.arguments.clone()),
                        data: None,
                    },
                );
                self.record(&call.name, &Args::new(), &result);
                result
            }
        }
    }

    fn dispatch_chain(&self, name: &str, args: &Args, chain: &mut Vec<String>) -> ToolResult {
        let result = self.invoke(name, args);
        self.record(name, args, &result);
        if !result.success {
            return result;
        }

        let hooks: Vec<String> = self
            .hooks
            .hooks_for(name)
            .into_iter()
            .map(str::to_string)
            .collect();
        if hooks.is_empty() {
            return result;
        }

        chain.push(name.to_string());
        let depth = u32::try_from(chain.len()).unwrap_or(u32::MAX);
        let mut reports = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let outcome = if depth > self.max_hook_depth {
                hook_refused(&hook, format!("hook depth limit {} reached", self.max_hook_depth))
            } else if chain.contains(&hook) {
                hook_refused(&hook, format!("hook '{hook}' is already running in this chain"))
            } else {
                debug!(trigger = %name, hook = %hook, depth, "running hook");
                let outcome = self.dispatch_chain(&hook, &Args::new(), chain);
                if outcome.success {
                    outcome
                } else {
                    as_hook_failure(outcome)
                }
            };
            if !outcome.success {
                warn!(trigger = %name, hook = %hook, "hook failed");
            }
            reports.push(HookReport { hook, outcome });
        }
        chain.pop();
        result.with_hooks(reports)
    }

    fn invoke(&self, name: &str, args: &Args) -> ToolResult {
        let Some(entry) = self.registry.resolve_in(name, self.mode) else {
            warn!(tool = %name, mode = ?self.mode, "tool not found");
            return not_found(name);
        };

        let violations = entry.schema_violations(args);
        if !violations.is_empty() {
            warn!(tool = %name, violations = %violations.join("; "), "arguments do not match schema");
        }

        match panic::catch_unwind(AssertUnwindSafe(|| entry.tool().call(args))) {
            Ok(Ok(value)) => {
                info!(tool = %name, "tool succeeded");
                ToolResult::ok(name, value)
            }
            Ok(Err(err)) => {
                warn!(tool = %name, err = %format!("{err:#}"), "tool failed");
                ToolResult::failed(name, failure_from_error(&err))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(tool = %name, panic = %message, "tool panicked");
                ToolResult::failed(
                    name,
                    ToolFailure {
                        kind: ErrorKind::ToolExecutionError,
                        message: format!("tool panicked: {message}"),
                        trace: None,
                        data: None,
                    },
                )
            }
        }
    }

    fn record(&self, name: &str, args: &Args, result: &ToolResult) {
        if let Err(err) = self.log.append(name, args, result) {
            warn!(tool = %name, err = %format!("{err:#}"), "failed to append execution log");
        }
    }
}

fn not_found(name: &str) -> ToolResult {
    ToolResult::failed(
        name,
        ToolFailure {
            kind: ErrorKind::ToolNotFound,
            message: format!("unknown tool '{name}'"),
            trace: None,
            data: None,
        },
    )
}

fn failure_from_error(err: &Error) -> ToolFailure {
    let kind = if err.downcast_ref::<ArgumentError>().is_some() {
        ErrorKind::ParseError
    } else {
        ErrorKind::ToolExecutionError
    };
    ToolFailure {
        kind,
        message: format!("{err:#}"),
        trace: Some(format!("{err:?}")),
        data: err
            .downcast_ref::<CommandFailed>()
            .map(|failed| failed.output.clone()),
    }
}

fn as_hook_failure(mut outcome: ToolResult) -> ToolResult {
    if let Some(error) = outcome.error.as_mut() {
        error.message = format!("{}: {}", error.kind, error.message);
        error.kind = ErrorKind::HookExecutionError;
    }
    outcome
}

fn hook_refused(hook: &str, message: String) -> ToolResult {
    ToolResult::failed(
        hook,
        ToolFailure {
            kind: ErrorKind::HookExecutionError,
            message,
            trace: None,
            data: None,
        },
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ModelTurn;
    use crate::hooks::HookMap;
    use anyhow::{Result, anyhow};
    use serde_json::{Value, json};
    use std::cell::Cell;
    use std::rc::Rc;

    fn spec(name: &str, mutating: bool) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: String::new(),
            parameters: json!({"type": "object"}),
            mutating,
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        registry: ToolRegistry,
        hooks: HookEngine,
        log: ExecutionLog,
    }

    fn fixture(map: HookMap) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = ExecutionLog::new(temp.path().join("tool_execution.log"));
        let hooks = HookEngine::with_map(temp.path().join("hooks.json"), map);
        Fixture {
            _temp: temp,
            registry: ToolRegistry::new(),
            hooks,
            log,
        }
    }

    fn map(entries: &[(&str, &[&str])]) -> HookMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn unknown_tool_is_not_found() {
        let fx = fixture(HookMap::new());
        let dispatcher = Dispatcher::new(&fx.registry, &fx.hooks, &fx.log);

        let result = dispatcher.dispatch("nope", &Args::new());
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::ToolNotFound));
        assert_eq!(fx.log.read_entries().expect("log").len(), 1);
    }

    #[test]
    fn failing_and_panicking_tools_are_contained() {
        let mut fx = fixture(HookMap::new());
        fx.registry.register(spec("boom", false), |_: &Args| -> Result<Value> {
            Err(anyhow!("disk on fire"))
        });
        fx.registry.register(spec("panic", false), |_: &Args| -> Result<Value> {
            panic!("index out of bounds")
        });
        let dispatcher = Dispatcher::new(&fx.registry, &fx.hooks, &fx.log);

        let result = dispatcher.dispatch("boom", &Args::new());
        assert_eq!(result.error_kind(), Some(ErrorKind::ToolExecutionError));
        assert!(result.error_message().expect("message").contains("disk on fire"));

        let result = dispatcher.dispatch("panic", &Args::new());
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::ToolExecutionError));
        assert!(result.error_message().expect("message").contains("index out of bounds"));
    }

    #[test]
    fn argument_errors_are_parse_errors() {
        let mut fx = fixture(HookMap::new());
        fx.registry.register(spec("read_file", false), |args: &Args| -> Result<Value> {
            let path = crate::tools::required_str(args, "path")?;
            Ok(json!(path))
        });
        let dispatcher = Dispatcher::new(&fx.registry, &fx.hooks, &fx.log);

        let result = dispatcher.dispatch("read_file", &Args::new());
        assert_eq!(result.error_kind(), Some(ErrorKind::ParseError));

        let call = ToolCall::new("c1", "read_file", "{not json");
        let result = dispatcher.dispatch_call(&call);
        assert_eq!(result.error_kind(), Some(ErrorKind::ParseError));
    }

    #[test]
    fn undecodable_call_fails_alone() {
        let mut fx = fixture(HookMap::new());
        fx.registry.register(spec("read_file", false), |args: &Args| -> Result<Value> {
            let path = crate::tools::required_str(args, "path")?;
            Ok(json!(path))
        });
        let dispatcher = Dispatcher::new(&fx.registry, &fx.hooks, &fx.log);
        let raw = r#"{"type":"tool_calls","calls":[
            {"arguments":{"path":"b.py"}},
            {"id":"c2","name":"read_file","arguments":{"path":"a.py"}}
        ]}"#;
        let ModelTurn::ToolCalls { calls, .. } = serde_json::from_str::<ModelTurn>(raw).expect("turn") else {
            panic!("expected tool calls");
        };

        let results: Vec<ToolResult> = calls.iter().map(|c| dispatcher.dispatch_call(c)).collect();
        assert_eq!(results[0].error_kind(), Some(ErrorKind::ParseError));
        assert!(results[1].success);
        assert_eq!(results[1].result, json!("a.py"));
        assert_eq!(fx.log.read_entries().expect("log").len(), 2);
    }

    #[test]
    fn command_failure_output_is_attached() {
        let mut fx = fixture(HookMap::new());
        fx.registry.register(spec("run_tests", true), |_: &Args| -> Result<Value> {
            Err(CommandFailed {
                message: "tests failed".to_string(),
                output: json!({"output": "FAILED tests/test_calc.py"}),
            }
            .into())
        });
        let dispatcher = Dispatcher::new(&fx.registry, &fx.hooks, &fx.log);

        let result = dispatcher.dispatch("run_tests", &Args::new());
        let data = result.error.as_ref().and_then(|e| e.data.clone()).expect("data");
        assert_eq!(data["output"], "FAILED tests/test_calc.py");
    }

    #[test]
    fn write_hook_runs_once_and_its_failure_is_isolated() {
        let mut fx = fixture(map(&[("on_write", &["run_tests"])]));
        let runs = Rc::new(Cell::new(0));
        fx.registry.register(spec("write_file", true), |_: &Args| -> Result<Value> {
            Ok(json!({"written": true}))
        });
        let counter = runs.clone();
        fx.registry.register(spec("run_tests", true), move |_: &Args| -> Result<Value> {
            counter.set(counter.get() + 1);
            Err(anyhow!("1 failed"))
        });
        let dispatcher = Dispatcher::new(&fx.registry, &fx.hooks, &fx.log);

        let result = dispatcher.dispatch("write_file", &Args::new());
        assert!(result.success);
        assert_eq!(runs.get(), 1);
        assert_eq!(result.hooks.len(), 1);
        assert_eq!(
            result.hooks[0].outcome.error_kind(),
            Some(ErrorKind::HookExecutionError)
        );
        // write_file and run_tests each logged once.
        let tools: Vec<String> = fx
            .log
            .read_entries()
            .expect("log")
            .into_iter()
            .map(|e| e.tool)
            .collect();
        assert_eq!(tools, vec!["write_file", "run_tests"]);
    }

    #[test]
    fn later_hooks_run_after_a_failing_one() {
        let mut fx = fixture(map(&[("write_file", &["missing_hook", "list_directory"])]));
        fx.registry.register(spec("write_file", true), |_: &Args| -> Result<Value> { Ok(json!(null)) });
        fx.registry.register(spec("list_directory", false), |_: &Args| -> Result<Value> {
            Ok(json!([]))
        });
        let dispatcher = Dispatcher::new(&fx.registry, &fx.hooks, &fx.log);

        let result = dispatcher.dispatch("write_file", &Args::new());
        assert!(result.success);
        assert!(!result.hooks[0].outcome.success);
        assert!(result.hooks[1].outcome.success);
    }

    #[test]
    fn hook_cycles_and_depth_are_bounded() {
        let mut fx = fixture(map(&[("a", &["b"]), ("b", &["a"])]));
        fx.registry.register(spec("a", false), |_: &Args| -> Result<Value> { Ok(json!("a")) });
        fx.registry.register(spec("b", false), |_: &Args| -> Result<Value> { Ok(json!("b")) });
        let dispatcher = Dispatcher::new(&fx.registry, &fx.hooks, &fx.log);

        let result = dispatcher.dispatch("a", &Args::new());
        assert!(result.success);
        let b = &result.hooks[0].outcome;
        assert!(b.success);
        let back_to_a = &b.hooks[0].outcome;
        assert!(!back_to_a.success);
        assert_eq!(back_to_a.error_kind(), Some(ErrorKind::HookExecutionError));

        let shallow = Dispatcher::new(&fx.registry, &fx.hooks, &fx.log).with_max_hook_depth(0);
        let result = shallow.dispatch("a", &Args::new());
        assert!(result.success);
        assert!(!result.hooks[0].outcome.success);
    }

    #[test]
    fn hook_chain_stops_at_configured_depth() {
        let mut fx = fixture(map(&[("a", &["b"]), ("b", &["c"])]));
        for name in ["a", "b", "c"] {
            fx.registry.register(spec(name, false), move |_: &Args| -> Result<Value> { Ok(json!(name)) });
        }
        let dispatcher = Dispatcher::new(&fx.registry, &fx.hooks, &fx.log).with_max_hook_depth(1);

        let result = dispatcher.dispatch("a", &Args::new());
        let b = &result.hooks[0].outcome;
        assert!(b.success);
        let c = &b.hooks[0].outcome;
        assert!(!c.success);
        assert!(c.error_message().expect("message").contains("depth limit 1"));
    }

    #[test]
    fn read_only_mode_refuses_mutating_tools() {
        let mut fx = fixture(HookMap::new());
        fx.registry.register(spec("write_file", true), |_: &Args| -> Result<Value> { Ok(json!(null)) });
        let dispatcher =
            Dispatcher::new(&fx.registry, &fx.hooks, &fx.log).with_mode(AccessMode::ReadOnly);

        let result = dispatcher.dispatch_call(&ToolCall::new("c", "write_file", "{}"));
        assert_eq!(result.error_kind(), Some(ErrorKind::ToolNotFound));
        assert!(dispatcher.advertised().is_empty());
    }
}

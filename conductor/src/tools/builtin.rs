//! Built-in actions over the workspace, processes and git.

use std::rc::Rc;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Result, anyhow};
use regex::{Regex, RegexBuilder};
use serde_json::{Value, json};
use tracing::debug;

use crate::core::types::{Args, ToolSpec};
use crate::io::git::Git;
use crate::io::process::{CommandSpec, ProcessOutput, ProcessRunner};
use crate::io::workspace::Workspace;
use crate::tools::registry::ToolRegistry;
use crate::tools::{CommandFailed, optional_str, required_str, required_u64};

const MAX_SEARCH_MATCHES: usize = 500;

static TEST_NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w+$").unwrap());

/// Shared collaborators for the built-in tools.
#[derive(Clone)]
pub struct BuiltinContext {
    pub workspace: Rc<dyn Workspace>,
    pub runner: Rc<dyn ProcessRunner>,
    pub test_command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl BuiltinContext {
    fn command(&self, argv: &[String]) -> Result<CommandSpec> {
        Ok(CommandSpec::from_argv(argv, self.workspace.root())?
            .timeout(self.timeout)
            .output_limit(self.output_limit_bytes))
    }

    fn git(&self) -> Git {
        Git::new(self.workspace.root(), self.runner.clone()).with_timeout(self.timeout)
    }
}

fn spec(name: &str, description: &str, mutating: bool, parameters: Value) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
        mutating,
    }
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Register every built-in tool. Existing entries with the same names are replaced.
pub fn register_builtins(registry: &mut ToolRegistry, ctx: &BuiltinContext) {
    let c = ctx.clone();
    registry.register(
        spec(
            "read_file",
            "Read a text file from the project.",
            false,
            object(json!({"path": {"type": "string"}}), &["path"]),
        ),
        move |args: &Args| read_file(&c, args),
    );

    let c = ctx.clone();
    registry.register(
        spec(
            "list_directory",
            "List the entries of a project directory.",
            false,
            object(json!({"path": {"type": "string"}}), &[]),
        ),
        move |args: &Args| list_directory(&c, args),
    );

    let c = ctx.clone();
    registry.register(
        spec(
            "search_code",
            "Case-insensitive regex search over project files.",
            false,
            object(
                json!({"pattern": {"type": "string"}, "path": {"type": "string"}}),
                &["pattern"],
            ),
        ),
        move |args: &Args| search_code(&c, args),
    );

    let c = ctx.clone();
    registry.register(
        spec(
            "write_file",
            "Create or overwrite a file with the given content.",
            true,
            object(
                json!({"path": {"type": "string"}, "content": {"type": "string"}}),
                &["path", "content"],
            ),
        ),
        move |args: &Args| write_file(&c, args),
    );

    let c = ctx.clone();
    registry.register(
        spec(
            "append_file",
            "Append content to a file, creating it if needed.",
            true,
            object(
                json!({"path": {"type": "string"}, "content": {"type": "string"}}),
                &["path", "content"],
            ),
        ),
        move |args: &Args| append_file(&c, args),
    );

    let c = ctx.clone();
    registry.register(
        spec(
            "edit_file_line",
            "Replace one line (1-based) of a file.",
            true,
            object(
                json!({
                    "path": {"type": "string"},
                    "line": {"type": "integer", "minimum": 1},
                    "new_line": {"type": "string"}
                }),
                &["path", "line", "new_line"],
            ),
        ),
        move |args: &Args| edit_file_line(&c, args),
    );

    let c = ctx.clone();
    registry.register(
        spec(
            "copy_file",
            "Copy a file within the project.",
            true,
            object(
                json!({"source": {"type": "string"}, "destination": {"type": "string"}}),
                &["source", "destination"],
            ),
        ),
        move |args: &Args| copy_file(&c, args),
    );

    let c = ctx.clone();
    registry.register(
        spec(
            "create_test",
            "Create tests/test_<name>.py wrapping the given pytest code.",
            true,
            object(
                json!({"name": {"type": "string"}, "code": {"type": "string"}}),
                &["name", "code"],
            ),
        ),
        move |args: &Args| create_test(&c, args),
    );

    let c = ctx.clone();
    registry.register(
        spec(
            "run_command",
            "Run a shell command in the project root.",
            true,
            object(json!({"command": {"type": "string"}}), &["command"]),
        ),
        move |args: &Args| run_command(&c, args),
    );

    let c = ctx.clone();
    registry.register(
        spec(
            "run_tests",
            "Run the project's test suite.",
            true,
            object(json!({}), &[]),
        ),
        move |_: &Args| run_tests(&c),
    );

    let c = ctx.clone();
    registry.register(
        spec(
            "git_commit",
            "Stage all changes and commit them.",
            true,
            object(json!({"message": {"type": "string"}}), &["message"]),
        ),
        move |args: &Args| git_commit(&c, args),
    );
}

fn read_file(ctx: &BuiltinContext, args: &Args) -> Result<Value> {
    let path = required_str(args, "path")?;
    let content = ctx.workspace.read(path)?;
    Ok(json!({"path": path, "content": content}))
}

fn list_directory(ctx: &BuiltinContext, args: &Args) -> Result<Value> {
    let path = optional_str(args, "path")?.unwrap_or(".");
    let entries = ctx.workspace.list(path)?;
    Ok(json!({"path": path, "entries": entries}))
}

fn search_code(ctx: &BuiltinContext, args: &Args) -> Result<Value> {
    let pattern = required_str(args, "pattern")?;
    let path = optional_str(args, "path")?.unwrap_or("");
    let re = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|err| anyhow!("invalid pattern: {err}"))?;

    let mut matches = Vec::new();
    let mut truncated = false;
    'files: for file in ctx.workspace.files(path)? {
        // Binary and unreadable files are skipped.
        let Ok(content) = ctx.workspace.read(&file) else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            if !re.is_match(line) {
                continue;
            }
            if matches.len() == MAX_SEARCH_MATCHES {
                truncated = true;
                break 'files;
            }
            matches.push(json!({"file": file, "line": idx + 1, "content": line.trim()}));
        }
    }
    debug!(pattern, count = matches.len(), "search finished");
    Ok(json!({"matches": matches, "truncated": truncated}))
}

fn write_file(ctx: &BuiltinContext, args: &Args) -> Result<Value> {
    let path = required_str(args, "path")?;
    let content = required_str(args, "content")?;
    ctx.workspace.write(path, content)?;
    Ok(json!({"path": path, "size": content.len()}))
}

fn append_file(ctx: &BuiltinContext, args: &Args) -> Result<Value> {
    let path = required_str(args, "path")?;
    let content = required_str(args, "content")?;
    ctx.workspace.append(path, content)?;
    Ok(json!({"path": path, "appended": content.len()}))
}

fn edit_file_line(ctx: &BuiltinContext, args: &Args) -> Result<Value> {
    let path = required_str(args, "path")?;
    let line = required_u64(args, "line")?;
    let new_line = required_str(args, "new_line")?;

    let content = ctx.workspace.read(path)?;
    let mut lines: Vec<&str> = content.split_inclusive('\n').collect();
    let count = lines.len();
    if line == 0 || line as usize > count {
        return Err(anyhow!("line {line} out of range (1-{count})"));
    }
    let idx = line as usize - 1;
    let old_line = lines[idx].trim_end_matches(['\r', '\n']).to_string();
    let replacement = if new_line.ends_with('\n') {
        new_line.to_string()
    } else {
        format!("{new_line}\n")
    };
    lines[idx] = &replacement;
    ctx.workspace.write(path, &lines.concat())?;
    Ok(json!({"path": path, "line": line, "old_line": old_line, "new_line": new_line}))
}

fn copy_file(ctx: &BuiltinContext, args: &Args) -> Result<Value> {
    let source = required_str(args, "source")?;
    let destination = required_str(args, "destination")?;
    ctx.workspace.copy(source, destination)?;
    Ok(json!({"source": source, "destination": destination}))
}

fn create_test(ctx: &BuiltinContext, args: &Args) -> Result<Value> {
    let name = required_str(args, "name")?;
    let code = required_str(args, "code")?;
    if !TEST_NAME_RE.is_match(name) {
        return Err(anyhow!("test name '{name}' must be a plain identifier"));
    }
    let path = format!("tests/test_{name}.py");
    let content = format!(
        "\"\"\"\nTests for {name}\n\"\"\"\nimport pytest\n\n{}\n\nif __name__ == \"__main__\":\n    pytest.main([__file__, \"-v\"])\n",
        code.trim_end()
    );
    ctx.workspace.write(&path, &content)?;
    Ok(json!({"path": path, "size": content.len()}))
}

fn run_command(ctx: &BuiltinContext, args: &Args) -> Result<Value> {
    let command = required_str(args, "command")?;
    let argv = ["sh".to_string(), "-c".to_string(), command.to_string()];
    let output = ctx.runner.run(&ctx.command(&argv)?)?;
    let payload = json!({
        "exit_code": output.exit_code,
        "stdout": output.stdout,
        "stderr": output.stderr,
        "timed_out": output.timed_out,
    });
    if output.success() {
        return Ok(payload);
    }
    Err(CommandFailed {
        message: failure_message("command", &output),
        output: payload,
    }
    .into())
}

fn run_tests(ctx: &BuiltinContext) -> Result<Value> {
    let output = ctx.runner.run(&ctx.command(&ctx.test_command)?)?;
    let passed = output.success();
    let payload = json!({
        "passed": passed,
        "exit_code": output.exit_code,
        "output": output.combined(),
    });
    if passed {
        return Ok(payload);
    }
    Err(CommandFailed {
        message: failure_message("tests", &output),
        output: payload,
    }
    .into())
}

fn git_commit(ctx: &BuiltinContext, args: &Args) -> Result<Value> {
    let message = required_str(args, "message")?;
    let git = ctx.git();
    git.add_all()?;
    let committed = git.commit_staged(message)?;
    let sha = if committed {
        Some(git.head_short_sha(8)?)
    } else {
        None
    };
    Ok(json!({"committed": committed, "sha": sha, "message": message}))
}

fn failure_message(what: &str, output: &ProcessOutput) -> String {
    if output.timed_out {
        return format!("{what} timed out");
    }
    match output.exit_code {
        Some(code) => format!("{what} failed (exit {code})"),
        None => format!("{what} was terminated by a signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::workspace::LocalWorkspace;
    use crate::test_support::ScriptedProcessRunner;

    struct Fixture {
        temp: tempfile::TempDir,
        runner: Rc<ScriptedProcessRunner>,
        registry: ToolRegistry,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = Rc::new(ScriptedProcessRunner::new());
        let ctx = BuiltinContext {
            workspace: Rc::new(LocalWorkspace::new(temp.path())),
            runner: runner.clone(),
            test_command: vec!["pytest".to_string(), "-q".to_string()],
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        };
        let mut registry = ToolRegistry::new();
        register_builtins(&mut registry, &ctx);
        Fixture {
            temp,
            runner,
            registry,
        }
    }

    fn call(fx: &Fixture, name: &str, args: Value) -> Result<Value> {
        let Value::Object(args) = args else {
            panic!("object expected");
        };
        fx.registry.resolve(name).expect("registered").tool().call(&args)
    }

    #[test]
    fn registers_read_and_write_tools_with_mutating_flags() {
        let fx = fixture();
        let read_only: Vec<String> = fx
            .registry
            .advertised(crate::tools::registry::AccessMode::ReadOnly)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(read_only, vec!["list_directory", "read_file", "search_code"]);
        assert_eq!(fx.registry.len(), 11);
    }

    #[test]
    fn write_then_read_and_edit_line() {
        let fx = fixture();
        call(&fx, "write_file", json!({"path": "src/calc.py", "content": "a = 1\nb = 2\n"}))
            .expect("write");
        let edited = call(
            &fx,
            "edit_file_line",
            json!({"path": "src/calc.py", "line": 2, "new_line": "b = 3"}),
        )
        .expect("edit");
        assert_eq!(edited["old_line"], "b = 2");

        let read = call(&fx, "read_file", json!({"path": "src/calc.py"})).expect("read");
        assert_eq!(read["content"], "a = 1\nb = 3\n");

        let err = call(
            &fx,
            "edit_file_line",
            json!({"path": "src/calc.py", "line": 9, "new_line": "x"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("out of range (1-2)"));
    }

    #[test]
    fn path_escape_is_refused() {
        let fx = fixture();
        let err = call(&fx, "write_file", json!({"path": "../evil.py", "content": ""}))
            .unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }

    #[test]
    fn search_is_case_insensitive() {
        let fx = fixture();
        call(&fx, "write_file", json!({"path": "src/calc.py", "content": "def Add(a, b):\n    pass\n"}))
            .expect("write");
        let found = call(&fx, "search_code", json!({"pattern": "def add"})).expect("search");
        assert_eq!(found["matches"][0]["file"], "src/calc.py");
        assert_eq!(found["matches"][0]["line"], 1);
        assert_eq!(found["truncated"], false);
    }

    #[test]
    fn create_test_writes_pytest_module() {
        let fx = fixture();
        call(&fx, "create_test", json!({"name": "calc", "code": "def test_add():\n    assert 1"}))
            .expect("create");
        let content =
            std::fs::read_to_string(fx.temp.path().join("tests/test_calc.py")).expect("read");
        assert!(content.contains("import pytest"));
        assert!(content.contains("def test_add():"));
        assert!(call(&fx, "create_test", json!({"name": "../x", "code": ""})).is_err());
    }

    #[test]
    fn failing_tests_carry_output() {
        let fx = fixture();
        fx.runner.push(ProcessOutput {
            exit_code: Some(1),
            stdout: "FAILED tests/test_calc.py::test_add".to_string(),
            ..ProcessOutput::default()
        });
        let err = call(&fx, "run_tests", json!({})).unwrap_err();
        let failed = err.downcast_ref::<CommandFailed>().expect("command failed");
        assert_eq!(failed.message, "tests failed (exit 1)");
        assert_eq!(failed.output["passed"], false);
        assert!(
            failed.output["output"]
                .as_str()
                .expect("output")
                .contains("tests/test_calc.py")
        );

        let ok = call(&fx, "run_tests", json!({})).expect("default run passes");
        assert_eq!(ok["passed"], true);
        assert_eq!(fx.runner.calls()[0].display(), "pytest -q");
    }

    #[test]
    fn git_commit_stages_then_commits() {
        let fx = fixture();
        let out = call(&fx, "git_commit", json!({"message": "build"})).expect("commit");
        assert_eq!(out["committed"], false);
        let calls: Vec<String> = fx.runner.calls().iter().map(CommandSpec::display).collect();
        assert_eq!(calls, vec!["git add -A", "git diff --cached --name-only"]);
    }
}

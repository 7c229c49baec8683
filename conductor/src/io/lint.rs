//! Per-file-type linting run after code generation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::io::config::LintCommand;
use crate::io::process::{CommandSpec, ProcessRunner};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LintReport {
    pub passed: bool,
    /// Replacement content the caller should write back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
}

impl LintReport {
    pub fn clean() -> Self {
        Self {
            passed: true,
            ..Self::default()
        }
    }
}

pub trait Linter {
    fn lint(&self, path: &str, content: &str) -> Result<LintReport>;
}

/// Whitespace fixes that need no external tool: tabs in indentation become
/// four spaces, trailing blanks are stripped, the file ends with one newline.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceLinter;

impl Linter for WhitespaceLinter {
    fn lint(&self, _path: &str, content: &str) -> Result<LintReport> {
        let mut messages = Vec::new();
        let mut lines = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let indent_len = line.len() - line.trim_start_matches([' ', '\t']).len();
            let (indent, rest) = line.split_at(indent_len);
            let mut fixed = String::with_capacity(line.len());
            if indent.contains('\t') {
                messages.push(format!("{}: tab in indentation", idx + 1));
                fixed.push_str(&indent.replace('\t', "    "));
            } else {
                fixed.push_str(indent);
            }
            fixed.push_str(rest);
            let trimmed = fixed.trim_end();
            if trimmed.len() != fixed.len() {
                messages.push(format!("{}: trailing whitespace", idx + 1));
            }
            lines.push(trimmed.to_string());
        }
        while lines.last().is_some_and(String::is_empty) {
            lines.pop();
        }
        let mut rebuilt = lines.join("\n");
        if !rebuilt.is_empty() {
            rebuilt.push('\n');
        }
        if rebuilt == content {
            return Ok(LintReport::clean());
        }
        if messages.is_empty() {
            messages.push("normalized end of file".to_string());
        }
        Ok(LintReport {
            passed: true,
            fixed: Some(rebuilt),
            messages,
        })
    }
}

/// Runs an external checker and, on failure, an optional in-place fixer.
pub struct CommandLinter {
    command: LintCommand,
    workdir: PathBuf,
    timeout: Duration,
    runner: Rc<dyn ProcessRunner>,
}

impl CommandLinter {
    pub fn new(
        command: LintCommand,
        workdir: impl Into<PathBuf>,
        timeout: Duration,
        runner: Rc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            timeout,
            runner,
        }
    }

    fn run(&self, argv: &[String], path: &str) -> Result<(bool, String)> {
        let argv = substitute_path(argv, path);
        let spec = CommandSpec::from_argv(&argv, &self.workdir)?.timeout(self.timeout);
        let output = self
            .runner
            .run(&spec)
            .with_context(|| format!("run linter {}", spec.display()))?;
        Ok((output.success(), output.combined()))
    }
}

impl Linter for CommandLinter {
    #[instrument(skip_all, fields(path))]
    fn lint(&self, path: &str, _content: &str) -> Result<LintReport> {
        let (ok, text) = self.run(&self.command.check, path)?;
        if ok {
            return Ok(LintReport::clean());
        }
        let mut messages: Vec<String> = text.lines().map(str::to_string).collect();
        if self.command.fix.is_empty() {
            return Ok(LintReport {
                passed: false,
                fixed: None,
                messages,
            });
        }
        debug!("check failed, running fixer");
        self.run(&self.command.fix, path)?;
        let (ok, text) = self.run(&self.command.check, path)?;
        if !ok {
            messages = text.lines().map(str::to_string).collect();
        }
        Ok(LintReport {
            passed: ok,
            fixed: None,
            messages,
        })
    }
}

fn substitute_path(argv: &[String], path: &str) -> Vec<String> {
    if argv.iter().any(|a| a.contains("{path}")) {
        argv.iter().map(|a| a.replace("{path}", path)).collect()
    } else {
        let mut out = argv.to_vec();
        out.push(path.to_string());
        out
    }
}

/// Linters keyed by file extension. Unknown extensions pass untouched.
#[derive(Default)]
pub struct LinterSet {
    by_ext: BTreeMap<String, Box<dyn Linter>>,
}

impl LinterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in whitespace linter for Python, overridden by configured commands.
    pub fn from_config(
        commands: &BTreeMap<String, LintCommand>,
        workdir: impl Into<PathBuf>,
        timeout: Duration,
        runner: Rc<dyn ProcessRunner>,
    ) -> Self {
        let workdir = workdir.into();
        let mut set = Self::new();
        set.insert("py", Box::new(WhitespaceLinter));
        for (ext, command) in commands {
            set.insert(
                ext,
                Box::new(CommandLinter::new(
                    command.clone(),
                    workdir.clone(),
                    timeout,
                    runner.clone(),
                )),
            );
        }
        set
    }

    pub fn insert(&mut self, ext: &str, linter: Box<dyn Linter>) {
        self.by_ext
            .insert(ext.trim_start_matches('.').to_ascii_lowercase(), linter);
    }

    pub fn lint(&self, path: &str, content: &str) -> Result<LintReport> {
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match self.by_ext.get(&ext) {
            Some(linter) => linter.lint(path, content),
            None => Ok(LintReport::clean()),
        }
    }
}

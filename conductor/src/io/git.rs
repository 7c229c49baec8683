//! Git adapter used by the commit action.
//!
//! Every call goes through a [`ProcessRunner`], so tests can script git the
//! same way they script the test suite.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::io::process::{CommandSpec, ProcessOutput, ProcessRunner};

#[derive(Clone)]
pub struct Git {
    workdir: PathBuf,
    runner: Rc<dyn ProcessRunner>,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, runner: Rc<dyn ProcessRunner>) -> Self {
        Self {
            workdir: workdir.into(),
            runner,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Return the current HEAD short SHA.
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_checked(&["diff", "--cached", "--name-only"])?;
        Ok(!out.stdout.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        Ok(self.run_checked(args)?.stdout)
    }

    fn run_checked(&self, args: &[&str]) -> Result<ProcessOutput> {
        let spec = CommandSpec::new("git", &self.workdir)
            .args(args.iter().copied())
            .timeout(self.timeout);
        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            ));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedProcessRunner;

    #[test]
    fn commit_is_skipped_when_nothing_is_staged() {
        let runner = Rc::new(ScriptedProcessRunner::new());
        let git = Git::new("/repo", runner.clone());

        assert!(!git.commit_staged("msg").expect("commit"));
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].display(), "git diff --cached --name-only");
    }

    #[test]
    fn commit_runs_when_changes_are_staged() {
        let runner = Rc::new(ScriptedProcessRunner::new());
        runner.push_git(ProcessOutput {
            exit_code: Some(0),
            stdout: "src/calc.py\n".to_string(),
            ..ProcessOutput::default()
        });
        let git = Git::new("/repo", runner.clone());

        assert!(git.commit_staged("add calc").expect("commit"));
        let calls = runner.calls();
        assert_eq!(calls[1].args, vec!["commit", "-m", "add calc"]);
    }

    #[test]
    fn failing_git_surfaces_stderr() {
        let runner = Rc::new(ScriptedProcessRunner::new());
        runner.push_git(ProcessOutput {
            exit_code: Some(128),
            stderr: "fatal: not a git repository".to_string(),
            ..ProcessOutput::default()
        });
        let git = Git::new("/repo", runner);
        let err = git.add_all().unwrap_err();
        assert!(err.to_string().contains("not a git repository"));
    }
}

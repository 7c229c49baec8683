//! Process executor: run a command with a timeout and bounded output.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// A command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            stdin: None,
            timeout: Duration::from_secs(300),
            output_limit_bytes: 100_000,
        }
    }

    /// Build from an argv vector (`["python", "-m", "pytest"]`).
    pub fn from_argv(argv: &[String], workdir: impl Into<PathBuf>) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("command must not be empty"))?;
        Ok(Self::new(program.clone(), workdir).args(args.iter().cloned()))
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished (or killed) process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal (including timeout).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Bytes dropped from stdout + stderr beyond the output limit.
    #[serde(default)]
    pub truncated_bytes: usize,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, with a notice for truncation or timeout.
    pub fn combined(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&self.stderr);
        }
        if self.truncated_bytes > 0 {
            buf.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated_bytes));
        }
        if self.timed_out {
            buf.push_str("\n[process timed out]\n");
        }
        buf
    }
}

/// Abstraction over process execution so tests can script results.
pub trait ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput>;
}

/// Runs commands on the local machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProcessRunner;

impl ProcessRunner for LocalProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        run_command_with_timeout(spec)
    }
}

/// Spawn `spec` and capture its output without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. A child that outlives
/// its timeout is killed and reported with `timed_out = true`.
#[instrument(skip_all, fields(program = %spec.program, timeout_secs = spec.timeout.as_secs()))]
pub fn run_command_with_timeout(spec: &CommandSpec) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args).current_dir(&spec.workdir);
    if spec.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!(command = %spec.display(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {}", spec.program));
        }
    };

    // Fed from its own thread so a child that never reads stdin cannot stall
    // us past the timeout.
    let stdin_handle = match &spec.stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.clone();
            // Dropping the handle at the end closes the pipe so the child sees EOF.
            Some(thread::spawn(move || child_stdin.write_all(&input)))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = spec.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let mut timed_out = false;
    let status = match child.wait_timeout(spec.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = spec.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    // After a kill the writer may still be parked on a pipe held by a
    // grandchild; leave it detached in that case.
    if let Some(handle) = stdin_handle
        && !timed_out
    {
        join_stdin(handle);
    }

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        exit_code: if timed_out { None } else { status.code() },
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        timed_out,
        truncated_bytes: stdout_truncated + stderr_truncated,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// A child is free to exit without reading all of its input.
fn join_stdin(handle: thread::JoinHandle<io::Result<()>>) {
    match handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {
            debug!("child closed stdin before reading all input");
        }
        Ok(Err(err)) => warn!(err = %err, "write stdin failed"),
        Err(_) => warn!("stdin writer thread panicked"),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_stream_limited_counts_dropped_bytes() {
        let data = vec![b'x'; 20_000];
        let (kept, truncated) = read_stream_limited(&data[..], 100).expect("read");
        assert_eq!(kept.len(), 100);
        assert_eq!(truncated, 19_900);
    }

    #[test]
    fn combined_output_marks_timeout_and_truncation() {
        let output = ProcessOutput {
            exit_code: None,
            stdout: "partial".to_string(),
            stderr: "warn".to_string(),
            timed_out: true,
            truncated_bytes: 12,
        };
        let text = output.combined();
        assert!(text.starts_with("partial\nwarn"));
        assert!(text.contains("[output truncated 12 bytes]"));
        assert!(text.contains("[process timed out]"));
        assert!(!output.success());
    }

    #[test]
    fn from_argv_rejects_empty_command() {
        let err = CommandSpec::from_argv(&[], ".").unwrap_err();
        assert!(err.to_string().contains("must not be empty"));

        let spec = CommandSpec::from_argv(
            &["python".to_string(), "-m".to_string(), "pytest".to_string()],
            ".",
        )
        .expect("spec");
        assert_eq!(spec.display(), "python -m pytest");
    }

    #[cfg(unix)]
    #[test]
    fn runs_real_command_and_captures_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("sh", temp.path())
            .args(["-c", "echo hello; echo oops >&2; exit 3"])
            .timeout(Duration::from_secs(10));
        let output = LocalProcessRunner.run(&spec).expect("run");
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn kills_command_after_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("sleep", temp.path())
            .args(["5"])
            .timeout(Duration::from_millis(200));
        let output = LocalProcessRunner.run(&spec).expect("run");
        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
    }

    #[cfg(unix)]
    #[test]
    fn unread_stdin_does_not_defeat_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("sh", temp.path())
            .args(["-c", "exec sleep 5"])
            .stdin(vec![b'x'; 1_000_000])
            .timeout(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let output = LocalProcessRunner.run(&spec).expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn child_exiting_without_reading_stdin_is_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("sh", temp.path())
            .args(["-c", "echo done"])
            .stdin(vec![b'x'; 1_000_000])
            .timeout(Duration::from_secs(10));

        let output = LocalProcessRunner.run(&spec).expect("run");
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "done");
    }
}

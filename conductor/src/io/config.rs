//! Engine configuration stored under `.conductor/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;

pub const CONFIG_PATH: &str = ".conductor/config.toml";

/// Engine configuration (TOML).
///
/// Meant to be edited by humans. Missing fields fall back to the defaults
/// below, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Agent loop step ceiling.
    pub max_steps: u32,

    /// Repair-and-retest cycles in the debug phase.
    pub max_retries: u32,

    /// How deep hooks may trigger further hooks.
    pub max_hook_depth: u32,

    /// Timeout applied to `run_command`, `run_tests` and git.
    pub command_timeout_secs: u64,

    /// Truncate captured process output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Directory (relative to the project root) for logs.
    pub state_dir: String,

    /// Hook map file, relative to the project root.
    pub hooks_file: String,

    pub test: TestConfig,
    pub connector: ConnectorConfig,

    /// File extension (without dot) to external lint command.
    pub lint: BTreeMap<String, LintCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestConfig {
    /// Test runner invocation (e.g. `["python","-m","pytest","tests"]`).
    pub command: Vec<String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: ["python", "-m", "pytest", "tests"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Program speaking the connector protocol on stdin/stdout. Empty means unset.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 300,
        }
    }
}

/// External linter for one file type. `{path}` in an argument is replaced by
/// the file path; without a placeholder the path is appended.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LintCommand {
    pub check: Vec<String>,
    /// Optional in-place fixer run when `check` fails.
    pub fix: Vec<String>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_retries: 3,
            max_hook_depth: 2,
            command_timeout_secs: 300,
            output_limit_bytes: 100_000,
            state_dir: ".conductor".to_string(),
            hooks_file: ".agent_hooks.json".to_string(),
            test: TestConfig::default(),
            connector: ConnectorConfig::default(),
            lint: BTreeMap::new(),
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.connector.timeout_secs == 0 {
            return Err(anyhow!("connector.timeout_secs must be > 0"));
        }
        if self.test.command.is_empty() || self.test.command[0].trim().is_empty() {
            return Err(anyhow!("test.command must be a non-empty array"));
        }
        if self.state_dir.trim().is_empty() {
            return Err(anyhow!("state_dir must not be empty"));
        }
        if self.hooks_file.trim().is_empty() {
            return Err(anyhow!("hooks_file must not be empty"));
        }
        for (ext, cmd) in &self.lint {
            if cmd.check.is_empty() || cmd.check[0].trim().is_empty() {
                return Err(anyhow!("lint.{ext}.check must be a non-empty array"));
            }
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn state_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.state_dir)
    }

    pub fn hooks_path(&self, root: &Path) -> PathBuf {
        root.join(&self.hooks_file)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

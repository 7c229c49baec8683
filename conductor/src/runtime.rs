//! Process-lifetime services for one project root.
//!
//! Config, hook map, logs, workspace, process runner and tool registry are
//! constructed once here and lent to the agent loop, the workflow and the
//! RPC server.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::hooks::{HookEngine, default_hook_map};
use crate::io::config::{CONFIG_PATH, ConductorConfig, load_config, write_config};
use crate::io::connector::CommandConnector;
use crate::io::exec_log::{EXEC_LOG_FILE, ExecutionLog};
use crate::io::lint::LinterSet;
use crate::io::process::{LocalProcessRunner, ProcessRunner};
use crate::io::workflow_log::{WORKFLOW_LOG_FILE, WorkflowLog};
use crate::io::workspace::{LocalWorkspace, Workspace};
use crate::tools::builtin::{BuiltinContext, register_builtins};
use crate::tools::dispatcher::Dispatcher;
use crate::tools::registry::{AccessMode, ToolRegistry};
use crate::workflow::WORKFLOW_STATE_FILE;

/// Name of the project metadata file written by the plan phase, inside the state dir.
pub const PROJECT_INFO_FILE: &str = "project_info.json";

pub struct Runtime {
    root: PathBuf,
    pub config: ConductorConfig,
    pub registry: ToolRegistry,
    pub hooks: HookEngine,
    pub exec_log: ExecutionLog,
    pub workflow_log: WorkflowLog,
    pub workspace: Rc<dyn Workspace>,
    pub runner: Rc<dyn ProcessRunner>,
}

impl Runtime {
    pub fn open(root: &Path) -> Result<Self> {
        Self::open_with_runner(root, Rc::new(LocalProcessRunner))
    }

    pub fn open_with_runner(root: &Path, runner: Rc<dyn ProcessRunner>) -> Result<Self> {
        let config = load_config(&root.join(CONFIG_PATH))?;
        Self::with_config(root, config, runner)
    }

    pub fn with_config(
        root: &Path,
        config: ConductorConfig,
        runner: Rc<dyn ProcessRunner>,
    ) -> Result<Self> {
        config.validate()?;
        let state_dir = config.state_dir(root);
        ensure_state_dir(&state_dir)?;

        let hooks = HookEngine::load(&config.hooks_path(root))?;
        let workspace: Rc<dyn Workspace> = Rc::new(LocalWorkspace::new(root));
        let mut registry = ToolRegistry::new();
        register_builtins(
            &mut registry,
            &BuiltinContext {
                workspace: workspace.clone(),
                runner: runner.clone(),
                test_command: config.test.command.clone(),
                timeout: config.command_timeout(),
                output_limit_bytes: config.output_limit_bytes,
            },
        );
        debug!(tools = registry.len(), root = %root.display(), "runtime ready");

        Ok(Self {
            root: root.to_path_buf(),
            exec_log: ExecutionLog::new(state_dir.join(EXEC_LOG_FILE)),
            workflow_log: WorkflowLog::new(state_dir.join(WORKFLOW_LOG_FILE)),
            config,
            registry,
            hooks,
            workspace,
            runner,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dispatcher(&self, mode: AccessMode) -> Dispatcher<'_> {
        Dispatcher::new(&self.registry, &self.hooks, &self.exec_log)
            .with_mode(mode)
            .with_max_hook_depth(self.config.max_hook_depth)
    }

    pub fn linters(&self) -> LinterSet {
        LinterSet::from_config(
            &self.config.lint,
            &self.root,
            self.config.command_timeout(),
            self.runner.clone(),
        )
    }

    /// Connector built from `connector.command`. Errors when it is not configured.
    pub fn connector(&self) -> Result<CommandConnector> {
        Ok(CommandConnector::new(
            self.config.connector.command.clone(),
            &self.root,
            self.runner.clone(),
        )?
        .with_timeout(std::time::Duration::from_secs(
            self.config.connector.timeout_secs,
        ))
        .with_output_limit(self.config.output_limit_bytes))
    }

    pub fn workflow_state_path(&self) -> PathBuf {
        self.config.state_dir(&self.root).join(WORKFLOW_STATE_FILE)
    }

    /// Relative path of the project metadata file.
    pub fn project_info_path(&self) -> String {
        format!(
            "{}/{}",
            self.config.state_dir.trim_end_matches('/'),
            PROJECT_INFO_FILE
        )
    }
}

/// Files written by [`init_project`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub config_written: bool,
    pub hooks_written: bool,
}

/// Write default config and hook files. Existing files are kept unless `force`.
pub fn init_project(root: &Path, force: bool) -> Result<InitReport> {
    let config_path = root.join(CONFIG_PATH);
    let config_written = force || !config_path.exists();
    let config = if config_written {
        let config = ConductorConfig::default();
        write_config(&config_path, &config)?;
        config
    } else {
        load_config(&config_path)?
    };

    ensure_state_dir(&config.state_dir(root))?;

    let hooks_path = config.hooks_path(root);
    let hooks_written = force || !hooks_path.exists();
    if hooks_written {
        HookEngine::with_map(&hooks_path, default_hook_map()).save()?;
    }
    info!(config_written, hooks_written, "initialized project");
    Ok(InitReport {
        config_written,
        hooks_written,
    })
}

fn ensure_state_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create state dir {}", dir.display()))?;
    let gitignore = dir.join(".gitignore");
    if !gitignore.exists() {
        fs::write(&gitignore, "*\n")
            .with_context(|| format!("write {}", gitignore.display()))?;
    }
    Ok(())
}

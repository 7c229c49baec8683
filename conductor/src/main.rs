//! Agent orchestration CLI.
//!
//! Works on the project in `--root` (default: current directory). State lives
//! in `.conductor/`; hooks in `.agent_hooks.json`.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};

use conductor::agent::{CHAT_TASK_TYPE, TaskRunner, ToolAgent};
use conductor::core::task::TaskStatus;
use conductor::error::ErrorKind;
use conductor::exit_codes;
use conductor::io::connector::ModelConnector;
use conductor::logging;
use conductor::rpc::RpcServer;
use conductor::runtime::{Runtime, init_project};
use conductor::tools::registry::AccessMode;
use conductor::workflow::{Workflow, WorkflowOutcome};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Tool dispatch, hooks, agent loop and build workflow for LLM agents"
)]
struct Cli {
    /// Project root.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.conductor/config.toml` and `.agent_hooks.json` if missing.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Print the advertised action specs as JSON.
    Tools {
        #[arg(long)]
        read_only: bool,
    },
    /// Dispatch one action and print its result.
    Dispatch {
        name: String,
        /// Arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Run the tool-calling agent loop on a goal.
    Agent {
        goal: String,
        /// Advertise and allow only non-mutating actions.
        #[arg(long)]
        read_only: bool,
        /// Overrides `max_steps` from the config.
        #[arg(long)]
        max_steps: Option<u32>,
    },
    /// Run the plan/generate/test/debug/commit workflow on a goal.
    Build {
        goal: String,
        /// Overrides `max_retries` from the config.
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Serve JSON-RPC requests on stdin/stdout, one per line.
    Serve,
    /// Show or change the hook map.
    Hooks {
        #[command(subcommand)]
        action: Option<HooksAction>,
    },
}

#[derive(Subcommand)]
enum HooksAction {
    /// Replace the follow-up actions for a trigger. No actions clears it.
    Set { trigger: String, actions: Vec<String> },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Tools { read_only } => cmd_tools(root, read_only),
        Command::Dispatch { name, args } => cmd_dispatch(root, &name, &args),
        Command::Agent {
            goal,
            read_only,
            max_steps,
        } => cmd_agent(root, &goal, read_only, max_steps),
        Command::Build { goal, max_retries } => cmd_build(root, &goal, max_retries),
        Command::Serve => cmd_serve(root),
        Command::Hooks { action } => cmd_hooks(root, action),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let report = init_project(root, force)?;
    print_json(&serde_json::json!({
        "config_written": report.config_written,
        "hooks_written": report.hooks_written,
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_tools(root: &Path, read_only: bool) -> Result<i32> {
    let runtime = Runtime::open(root)?;
    print_json(&runtime.dispatcher(access_mode(read_only)).advertised())?;
    Ok(exit_codes::OK)
}

fn cmd_dispatch(root: &Path, name: &str, raw_args: &str) -> Result<i32> {
    let args: Map<String, Value> = match serde_json::from_str(raw_args) {
        Ok(Value::Object(map)) => map,
        Ok(other) => bail!("--args must be a JSON object, got {other}"),
        Err(err) => return Err(err).context("parse --args"),
    };
    let runtime = Runtime::open(root)?;
    let result = runtime.dispatcher(AccessMode::Full).dispatch(name, &args);
    print_json(&result)?;
    Ok(if result.success {
        exit_codes::OK
    } else {
        exit_codes::TOOL_FAILED
    })
}

fn cmd_agent(root: &Path, goal: &str, read_only: bool, max_steps: Option<u32>) -> Result<i32> {
    let runtime = Runtime::open(root)?;
    let connector = runtime.connector()?;
    let dispatcher = runtime.dispatcher(access_mode(read_only));
    let agent = ToolAgent::new(&connector, &dispatcher)
        .with_max_steps(max_steps.unwrap_or(runtime.config.max_steps));
    let mut runner = TaskRunner::new(agent);

    let task_type = if read_only { CHAT_TASK_TYPE } else { "general" };
    let task = runner.submit(goal, task_type, Map::new())?;
    print_json(&task)?;
    Ok(match (task.status, task.error_kind) {
        (TaskStatus::Completed, _) => exit_codes::OK,
        (_, Some(ErrorKind::StepLimitReached)) => exit_codes::STEP_LIMIT,
        _ => exit_codes::TOOL_FAILED,
    })
}

fn cmd_build(root: &Path, goal: &str, max_retries: Option<u32>) -> Result<i32> {
    let runtime = Runtime::open(root)?;
    let connector = runtime.connector()?;
    let dispatcher = runtime.dispatcher(AccessMode::Full);
    let linters = runtime.linters();
    let mut workflow = Workflow::new(&runtime, &connector, &dispatcher, &linters);
    if let Some(max_retries) = max_retries {
        workflow = workflow.with_max_retries(max_retries);
    }

    let run = workflow.run(goal)?;
    print_json(&run)?;
    Ok(match run.outcome {
        WorkflowOutcome::Committed { success: true, .. } => exit_codes::OK,
        WorkflowOutcome::Committed { success: false, .. } => exit_codes::TOOL_FAILED,
        WorkflowOutcome::Abandoned { .. } => exit_codes::ABANDONED,
    })
}

fn cmd_serve(root: &Path) -> Result<i32> {
    let runtime = Runtime::open(root)?;
    // Tool methods work without a model; workflow phases that need one report it.
    let connector = runtime.connector().ok();
    let server = RpcServer::new(
        &runtime,
        connector.as_ref().map(|c| c as &dyn ModelConnector),
    );
    let stdin = io::stdin();
    server.serve(stdin.lock(), io::stdout().lock())?;
    Ok(exit_codes::OK)
}

fn cmd_hooks(root: &Path, action: Option<HooksAction>) -> Result<i32> {
    let mut runtime = Runtime::open(root)?;
    if let Some(HooksAction::Set { trigger, actions }) = action {
        runtime.hooks.set(trigger, actions);
        runtime.hooks.save()?;
    }
    print_json(runtime.hooks.map())?;
    Ok(exit_codes::OK)
}

fn access_mode(read_only: bool) -> AccessMode {
    if read_only {
        AccessMode::ReadOnly
    } else {
        AccessMode::Full
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{out}");
    Ok(())
}

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::extract::{TargetExtractor, TestFileConvention};
use crate::core::parse::{extract_code, fence_language};
use crate::core::plan::{BuildPlan, FilePlan, project_name};
use crate::core::step::{Phase, WorkflowStep};
use crate::core::types::Args;
use crate::error::ErrorKind;
use crate::io::connector::{ModelConnector, complete_text};
use crate::io::lint::LinterSet;
use crate::io::prompt::{CodegenPrompt, PromptEngine, SourceFile, WORKFLOW_SYSTEM};
use crate::io::workflow_log::WorkflowLog;
use crate::io::workspace::Workspace;
use crate::runtime::Runtime;
use crate::tools::dispatcher::Dispatcher;
use crate::workflow::{TestReport, WorkflowOutcome, WorkflowRun, WorkflowState};

/// Drives the phases for one goal. Phases can be called one by one or all
/// at once through [`Workflow::run`].
pub struct Workflow<'a> {
    pub(super) connector: &'a dyn ModelConnector,
    pub(super) dispatcher: &'a Dispatcher<'a>,
    pub(super) workspace: &'a dyn Workspace,
    pub(super) log: &'a WorkflowLog,
    pub(super) linters: &'a LinterSet,
    pub(super) extractor: Box<dyn TargetExtractor + 'a>,
    pub(super) prompts: PromptEngine,
    pub(super) max_retries: u32,
    metadata_path: String,
    pub(super) state: WorkflowState,
}

impl<'a> Workflow<'a> {
    /// Workflow over the runtime's workspace and workflow log, with retry
    /// budget from config and the pytest file convention.
    pub fn new(
        runtime: &'a Runtime,
        connector: &'a dyn ModelConnector,
        dispatcher: &'a Dispatcher<'a>,
        linters: &'a LinterSet,
    ) -> Self {
        Self {
            connector,
            dispatcher,
            workspace: &*runtime.workspace,
            log: &runtime.workflow_log,
            linters,
            extractor: Box::new(TestFileConvention::default()),
            prompts: PromptEngine::new(),
            max_retries: runtime.config.max_retries,
            metadata_path: runtime.project_info_path(),
            state: WorkflowState::default(),
        }
    }

    pub fn with_extractor(mut self, extractor: impl TargetExtractor + 'a) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Resume from state saved by an earlier session.
    pub fn with_state(mut self, state: WorkflowState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn into_state(self) -> WorkflowState {
        self.state
    }

    /// Run every phase until the workflow commits or gives up.
    #[instrument(skip_all)]
    pub fn run(&mut self, goal: &str) -> Result<WorkflowRun> {
        let mut steps = Vec::new();

        let (plan_step, failure) = self.plan_phase(goal)?;
        steps.push(plan_step);
        if let Some((kind, reason)) = failure {
            steps.push(self.abandon(kind, &reason)?);
            return Ok(WorkflowRun {
                outcome: WorkflowOutcome::Abandoned { kind, reason },
                steps,
            });
        }

        steps.push(self.code_gen()?);
        let test_step = self.test()?;
        let passed = test_step.success;
        steps.push(test_step);

        if !passed {
            let report = self.debug()?;
            steps.extend(report.steps);
            if !report.outcome.is_fixed() {
                let kind = report.outcome.error_kind();
                let reason = report.outcome.reason();
                steps.push(self.abandon(kind, &reason)?);
                return Ok(WorkflowRun {
                    outcome: WorkflowOutcome::Abandoned { kind, reason },
                    steps,
                });
            }
        }

        let message = self.default_commit_message();
        let commit_step = self.commit(Some(&message))?;
        let success = commit_step.success;
        steps.push(commit_step);
        info!(success, "workflow finished");
        Ok(WorkflowRun {
            outcome: WorkflowOutcome::Committed { success, message },
            steps,
        })
    }

    /// Ask for a build plan. Starts a fresh workflow state for `goal`.
    pub fn plan(&mut self, goal: &str) -> Result<WorkflowStep> {
        Ok(self.plan_phase(goal)?.0)
    }

    #[instrument(skip_all)]
    fn plan_phase(
        &mut self,
        goal: &str,
    ) -> Result<(WorkflowStep, Option<(Option<ErrorKind>, String)>)> {
        self.state = WorkflowState {
            goal: Some(goal.to_string()),
            ..WorkflowState::default()
        };
        let prompt = self.prompts.render_plan(goal)?;

        let planned = match complete_text(self.connector, WORKFLOW_SYSTEM, &prompt) {
            Ok(reply) => BuildPlan::from_reply(&reply)
                .map_err(|err| (Some(ErrorKind::ParseError), err.to_string())),
            Err(err) => Err((None, format!("model connector failed: {err:#}"))),
        };

        match planned {
            Ok(plan) => {
                info!(files = plan.files.len(), "plan accepted");
                self.write_metadata(goal, &plan);
                let step = WorkflowStep::new(
                    Phase::Plan,
                    format!("plan {} file(s) for: {goal}", plan.files.len()),
                    true,
                    json!({"goal": goal, "plan": plan}),
                );
                self.state.plan = Some(plan);
                Ok((self.record(step)?, None))
            }
            Err((kind, reason)) => {
                warn!(reason = %reason, "no usable plan");
                let step = WorkflowStep::new(
                    Phase::Plan,
                    format!("plan for: {goal}"),
                    false,
                    json!({"goal": goal, "kind": kind, "error": reason}),
                );
                Ok((self.record(step)?, Some((kind, reason))))
            }
        }
    }

    /// Generate every planned file, sources before tests.
    #[instrument(skip_all)]
    pub fn code_gen(&mut self) -> Result<WorkflowStep> {
        let plan = self
            .state
            .plan
            .clone()
            .ok_or_else(|| anyhow!("no plan yet; run the plan phase first"))?;
        let goal = self.state.goal.clone().unwrap_or_default();

        let mut sources: Vec<SourceFile> = Vec::new();
        let mut files = Vec::new();
        let mut all_written = true;
        for file in plan.generation_order() {
            match self.generate_file(&goal, file, &sources) {
                Ok((content, lint)) => {
                    debug!(path = %file.path, bytes = content.len(), "generated file");
                    self.state.generated.push(file.path.clone());
                    files.push(json!({
                        "path": file.path,
                        "is_test_file": file.is_test_file,
                        "written": true,
                        "lint": lint,
                    }));
                    sources.push(SourceFile::new(&file.path, content));
                }
                Err(err) => {
                    warn!(path = %file.path, err = %format!("{err:#}"), "code generation failed");
                    all_written = false;
                    files.push(json!({
                        "path": file.path,
                        "is_test_file": file.is_test_file,
                        "written": false,
                        "error": format!("{err:#}"),
                    }));
                }
            }
        }

        let step = WorkflowStep::new(
            Phase::CodeGen,
            format!("generate {} file(s)", plan.files.len()),
            all_written,
            json!({"files": files}),
        );
        self.record(step)
    }

    fn generate_file(
        &self,
        goal: &str,
        file: &FilePlan,
        sources: &[SourceFile],
    ) -> Result<(String, Value)> {
        let prompt = self.prompts.render_codegen(&CodegenPrompt {
            goal,
            path: &file.path,
            description: &file.description,
            sources,
        })?;
        let reply = complete_text(self.connector, WORKFLOW_SYSTEM, &prompt)?;
        let mut content = extract_code(&reply, fence_language(&file.path))
            .ok_or_else(|| anyhow!("model returned no content for {}", file.path))?;
        self.workspace.write(&file.path, &content)?;

        let lint = match self.linters.lint(&file.path, &content) {
            Ok(report) => {
                if let Some(fixed) = &report.fixed {
                    self.workspace.write(&file.path, fixed)?;
                    content = fixed.clone();
                }
                json!({"passed": report.passed, "fixed": report.fixed.is_some(), "messages": report.messages})
            }
            Err(err) => {
                warn!(path = %file.path, err = %format!("{err:#}"), "lint failed");
                json!({"passed": false, "error": format!("{err:#}")})
            }
        };
        Ok((content, lint))
    }

    /// Run the suite through `run_tests`.
    #[instrument(skip_all)]
    pub fn test(&mut self) -> Result<WorkflowStep> {
        let report = TestReport::from_result(&self.dispatcher.dispatch("run_tests", &Args::new()));
        info!(passed = report.passed, "test phase");
        let step = WorkflowStep::new(
            Phase::Test,
            "run test suite",
            report.passed,
            json!({"output": report.output}),
        );
        self.state.last_test = Some(report);
        self.record(step)
    }

    /// Commit the working tree through `git_commit`. Always terminal; a
    /// failed commit is reported in the step, not as an error.
    #[instrument(skip_all)]
    pub fn commit(&mut self, message: Option<&str>) -> Result<WorkflowStep> {
        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| self.default_commit_message());
        let mut args = Args::new();
        args.insert("message".to_string(), json!(message));
        let result = self.dispatcher.dispatch("git_commit", &args);

        let step = WorkflowStep::new(
            Phase::Commit,
            format!("commit: {message}"),
            result.success,
            json!({
                "message": message,
                "result": result.result,
                "error": result.error_message(),
            }),
        );
        self.record(step)
    }

    /// Record that the workflow gave up.
    pub fn abandon(&mut self, kind: Option<ErrorKind>, reason: &str) -> Result<WorkflowStep> {
        warn!(kind = ?kind, reason, "workflow abandoned");
        let step = WorkflowStep::new(
            Phase::Abandoned,
            format!("abandoned: {reason}"),
            false,
            json!({"kind": kind, "reason": reason}),
        );
        self.record(step)
    }

    pub(super) fn record(&mut self, step: WorkflowStep) -> Result<WorkflowStep> {
        self.log
            .append(&step)
            .with_context(|| format!("log {} step", step.label))?;
        self.state.phase = Some(step.phase);
        Ok(step)
    }

    fn default_commit_message(&self) -> String {
        match &self.state.goal {
            Some(goal) => format!("Build {}: {}", project_name(goal), goal.trim()),
            None => "Build project".to_string(),
        }
    }

    /// Metadata is informational; failing to write it does not stop the plan.
    fn write_metadata(&self, goal: &str, plan: &BuildPlan) {
        let info = json!({
            "name": project_name(goal),
            "goal": goal,
            "plan": plan,
            "created_at": Utc::now(),
        });
        let written = serde_json::to_string_pretty(&info)
            .context("serialize project metadata")
            .and_then(|body| self.workspace.write(&self.metadata_path, &format!("{body}\n")));
        if let Err(err) = written {
            warn!(path = %self.metadata_path, err = %format!("{err:#}"), "project metadata not written");
        }
    }
}

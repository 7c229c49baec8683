//! Repair loop: locate the failing source, ask for a rewrite, re-test.

use anyhow::{Result, bail};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::core::extract::FailingTarget;
use crate::core::parse::{extract_code, fence_language};
use crate::core::step::{DebugAttempt, Phase, WorkflowStep};
use crate::core::types::Args;
use crate::io::connector::complete_text;
use crate::io::prompt::{DebugPrompt, WORKFLOW_SYSTEM};
use crate::workflow::machine::Workflow;
use crate::workflow::{DebugOutcome, DebugReport, TestReport};

impl Workflow<'_> {
    /// Up to `max_retries` fix-and-retest cycles against the last failing run.
    ///
    /// Logs one `debug` step carrying every attempt, followed by a
    /// `test:success` step when a fix made the suite pass.
    #[instrument(skip_all, fields(max_retries = self.max_retries))]
    pub fn debug(&mut self) -> Result<DebugReport> {
        let Some(report) = self.state.last_test.clone() else {
            bail!("no test results yet; run the test phase first");
        };
        if report.passed {
            bail!("tests already pass; nothing to debug");
        }

        let mut output = report.output;
        let mut attempts = Vec::new();
        let mut last_target = None;
        let mut outcome = None;
        for attempt in 1..=self.max_retries {
            let Some(target) = self.extractor.extract(&output) else {
                outcome = Some(DebugOutcome::Unidentifiable {
                    reason: "test output names no recognizable test file".to_string(),
                });
                break;
            };
            last_target = Some(target.clone());

            let current = match self.read_source(&target) {
                Ok(content) => content,
                Err(reason) => {
                    outcome = Some(DebugOutcome::Unidentifiable { reason });
                    break;
                }
            };
            let Some(fixed) = self.request_fix(&target, &output, &current) else {
                outcome = Some(DebugOutcome::NoFix {
                    attempt,
                    reason: format!("model produced no fix for {}", target.source_file),
                });
                break;
            };
            self.workspace.write(&target.source_file, &fixed)?;

            let retest =
                TestReport::from_result(&self.dispatcher.dispatch("run_tests", &Args::new()));
            info!(attempt, passed = retest.passed, file = %target.source_file, "debug attempt");
            attempts.push(DebugAttempt {
                attempt,
                target,
                tests_passed: retest.passed,
                output: retest.output.clone(),
            });
            let passed = retest.passed;
            output = retest.output.clone();
            self.state.last_test = Some(retest);
            if passed {
                outcome = Some(DebugOutcome::Fixed { attempts: attempt });
                break;
            }
        }
        let outcome = outcome.unwrap_or(DebugOutcome::Exhausted {
            attempts: self.max_retries,
        });

        let description = match &last_target {
            Some(target) => format!("debug {} against {}", target.source_file, target.test_file),
            None => "debug failing tests".to_string(),
        };
        let mut payload = outcome_payload(&outcome);
        payload["target"] = json!(last_target);
        let debug_step = WorkflowStep::new(Phase::Debug, description, outcome.is_fixed(), payload)
            .with_attempts(attempts);
        let mut steps = vec![self.record(debug_step)?];

        if outcome.is_fixed() {
            let step = WorkflowStep::new(
                Phase::Test,
                "re-run test suite after fix",
                true,
                json!({"output": output}),
            );
            steps.push(self.record(step)?);
        } else {
            warn!(reason = %outcome.reason(), "debug gave up");
        }
        Ok(DebugReport { steps, outcome })
    }

    /// Current source through `read_file`. A missing file leaves nothing to repair.
    fn read_source(&self, target: &FailingTarget) -> Result<String, String> {
        let mut args = Args::new();
        args.insert("path".to_string(), json!(target.source_file));
        let read = self.dispatcher.dispatch("read_file", &args);
        if !read.success {
            return Err(format!(
                "cannot read {}: {}",
                target.source_file,
                read.error_message().unwrap_or("unknown error")
            ));
        }
        Ok(read.result["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    fn request_fix(&self, target: &FailingTarget, output: &str, current: &str) -> Option<String> {
        let test_content = self.workspace.read(&target.test_file).ok();
        let prompt = self
            .prompts
            .render_debug(&DebugPrompt {
                source_file: &target.source_file,
                test_file: &target.test_file,
                output,
                content: current,
                test_content: test_content.as_deref(),
            })
            .inspect_err(|err| warn!(err = %format!("{err:#}"), "debug prompt failed"))
            .ok()?;
        let reply = complete_text(self.connector, WORKFLOW_SYSTEM, &prompt)
            .inspect_err(|err| warn!(err = %format!("{err:#}"), "connector failed during debug"))
            .ok()?;
        extract_code(&reply, fence_language(&target.source_file))
    }
}

fn outcome_payload(outcome: &DebugOutcome) -> Value {
    json!({
        "outcome": outcome,
        "kind": outcome.error_kind(),
        "reason": outcome.reason(),
    })
}

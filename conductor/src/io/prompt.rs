//! Prompt rendering for the agent loop and the workflow phases.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::parse::fence_language;
use crate::core::task::MemoryEntry;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const CODEGEN_TEMPLATE: &str = include_str!("prompts/codegen.md");
const DEBUG_TEMPLATE: &str = include_str!("prompts/debug.md");

/// System prompt for the single-shot workflow requests.
pub const WORKFLOW_SYSTEM: &str = "You are a careful software engineer. Follow the requested \
output format exactly and do not add commentary outside it.";

/// Memory entries shown in the agent system prompt.
const MEMORY_WINDOW: usize = 5;

/// A file already generated, shown to later code generation requests.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFile {
    pub path: String,
    pub lang: &'static str,
    pub content: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            lang: fence_language(&path).unwrap_or(""),
            path,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodegenPrompt<'a> {
    pub goal: &'a str,
    pub path: &'a str,
    pub description: &'a str,
    pub sources: &'a [SourceFile],
}

#[derive(Debug, Clone)]
pub struct DebugPrompt<'a> {
    pub source_file: &'a str,
    pub test_file: &'a str,
    pub output: &'a str,
    pub content: &'a str,
    pub test_content: Option<&'a str>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        env.add_template("codegen", CODEGEN_TEMPLATE)
            .expect("codegen template should be valid");
        env.add_template("debug", DEBUG_TEMPLATE)
            .expect("debug template should be valid");
        Self { env }
    }

    pub fn render_system(&self, read_only: bool, memory: &[MemoryEntry]) -> Result<String> {
        let recent = &memory[memory.len().saturating_sub(MEMORY_WINDOW)..];
        let template = self.env.get_template("system")?;
        Ok(template.render(context! {
            read_only => read_only,
            memory => recent,
        })?)
    }

    pub fn render_plan(&self, goal: &str) -> Result<String> {
        let template = self.env.get_template("plan")?;
        Ok(template.render(context! { goal => goal.trim() })?)
    }

    pub fn render_codegen(&self, input: &CodegenPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("codegen")?;
        Ok(template.render(context! {
            goal => input.goal.trim(),
            path => input.path,
            description => input.description.trim(),
            sources => input.sources,
        })?)
    }

    pub fn render_debug(&self, input: &DebugPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("debug")?;
        Ok(template.render(context! {
            source_file => input.source_file,
            test_file => input.test_file,
            output => input.output.trim(),
            content => input.content.trim_end(),
            test_content => input.test_content.map(str::trim_end).filter(|s| !s.is_empty()),
            lang => fence_language(input.source_file).unwrap_or(""),
        })?)
    }
}

//! Build plan produced by the planning phase.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::parse::{Parsed, parse_structured};

/// One file the build should create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePlan {
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_test_file: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildPlan {
    #[serde(default)]
    pub files: Vec<FilePlan>,
}

/// Some models wrap the plan: `{"plan": {"files": [...]}}`.
#[derive(Deserialize)]
struct WrappedPlan {
    plan: BuildPlan,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanShape {
    // Wrapped first: a flat plan with defaulted `files` would accept anything.
    Wrapped(WrappedPlan),
    Flat(BuildPlan),
}

impl From<PlanShape> for BuildPlan {
    fn from(shape: PlanShape) -> Self {
        match shape {
            PlanShape::Wrapped(w) => w.plan,
            PlanShape::Flat(p) => p,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("model reply did not contain a plan: {excerpt}")]
    Unparseable { excerpt: String },
    #[error("plan lists no files")]
    Empty,
    #[error("plan entry {index} has an empty path")]
    EmptyPath { index: usize },
}

impl BuildPlan {
    /// Parse a model reply through the structured fallback chain.
    pub fn from_reply(reply: &str) -> Result<Self, PlanError> {
        let plan: BuildPlan = match parse_structured::<PlanShape>(reply) {
            Parsed::Strict(shape) | Parsed::Extracted(shape) => shape.into(),
            Parsed::Raw(text) => {
                return Err(PlanError::Unparseable {
                    excerpt: text.chars().take(200).collect(),
                });
            }
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.files.is_empty() {
            return Err(PlanError::Empty);
        }
        if let Some(index) = self.files.iter().position(|f| f.path.trim().is_empty()) {
            return Err(PlanError::EmptyPath { index });
        }
        Ok(())
    }

    /// Files in generation order: sources first, tests deferred.
    pub fn generation_order(&self) -> impl Iterator<Item = &FilePlan> {
        self.files
            .iter()
            .filter(|f| !f.is_test_file)
            .chain(self.files.iter().filter(|f| f.is_test_file))
    }

    pub fn has_tests(&self) -> bool {
        self.files.iter().any(|f| f.is_test_file)
    }
}

/// Short kebab-case project name derived from the goal: at most five words,
/// ASCII letters and digits only, `project` when nothing usable remains.
pub fn project_name(goal: &str) -> String {
    let words: Vec<String> = goal
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(5)
        .map(str::to_ascii_lowercase)
        .collect();
    if words.is_empty() {
        return "project".to_string();
    }
    words.join("-")
}

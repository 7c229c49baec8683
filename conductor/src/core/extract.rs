//! Locate the source file responsible for a failing test run.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static PYTEST_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"tests/test_(\w+)\.py").unwrap());

/// A failing test file and the source file it exercises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingTarget {
    pub test_file: String,
    pub source_file: String,
}

/// Strategy for mapping raw test output to a repair target.
///
/// Returning `None` means the output names nothing we can repair; callers
/// treat that as a hard stop rather than guessing.
pub trait TargetExtractor {
    fn extract(&self, output: &str) -> Option<FailingTarget>;
}

impl<F> TargetExtractor for F
where
    F: Fn(&str) -> Option<FailingTarget>,
{
    fn extract(&self, output: &str) -> Option<FailingTarget> {
        self(output)
    }
}

/// `tests/test_<module>.py` implies `src/<module>.py`.
#[derive(Debug, Clone)]
pub struct TestFileConvention {
    pattern: Regex,
    source_template: String,
}

impl TestFileConvention {
    /// `pattern` must capture the module name in group 1; `source_template`
    /// substitutes it for `{module}`.
    pub fn new(pattern: Regex, source_template: impl Into<String>) -> Self {
        Self {
            pattern,
            source_template: source_template.into(),
        }
    }
}

impl Default for TestFileConvention {
    fn default() -> Self {
        Self::new(PYTEST_FILE_RE.clone(), "src/{module}.py")
    }
}

impl TargetExtractor for TestFileConvention {
    fn extract(&self, output: &str) -> Option<FailingTarget> {
        let caps = self.pattern.captures(output)?;
        let module = caps.get(1)?.as_str();
        Some(FailingTarget {
            test_file: caps.get(0)?.as_str().to_string(),
            source_file: self.source_template.replace("{module}", module),
        })
    }
}

//! Name → tool lookup with advertised specs.

use std::collections::BTreeMap;

use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::{Args, ToolSpec};
use crate::tools::Tool;

/// Which tools a caller may see and invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Full,
    /// Only tools that neither write files nor run processes.
    ReadOnly,
}

impl AccessMode {
    pub fn allows(self, spec: &ToolSpec) -> bool {
        match self {
            AccessMode::Full => true,
            AccessMode::ReadOnly => !spec.mutating,
        }
    }
}

pub struct ToolEntry {
    pub spec: ToolSpec,
    tool: Box<dyn Tool>,
    validator: Option<Validator>,
}

impl ToolEntry {
    pub fn tool(&self) -> &dyn Tool {
        self.tool.as_ref()
    }

    /// Schema violations for `args`. Empty when valid or when the schema
    /// itself could not be compiled.
    pub fn schema_violations(&self, args: &Args) -> Vec<String> {
        let Some(validator) = &self.validator else {
            return Vec::new();
        };
        let instance = Value::Object(args.clone());
        validator
            .iter_errors(&instance)
            .map(|err| err.to_string())
            .collect()
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Registering an existing name replaces it.
    pub fn register(&mut self, spec: ToolSpec, tool: impl Tool + 'static) {
        let validator = match validator_for(&spec.parameters) {
            Ok(v) => Some(v),
            Err(err) => {
                warn!(tool = %spec.name, err = %err, "invalid parameter schema, skipping validation");
                None
            }
        };
        let name = spec.name.clone();
        let entry = ToolEntry {
            spec,
            tool: Box::new(tool),
            validator,
        };
        if self.tools.insert(name.clone(), entry).is_some() {
            debug!(tool = %name, "replaced registered tool");
        }
    }

    pub fn resolve(&self, name: &str) -> Option<&ToolEntry> {
        self.tools.get(name)
    }

    /// Resolve only if `mode` lets the caller see the tool.
    pub fn resolve_in(&self, name: &str, mode: AccessMode) -> Option<&ToolEntry> {
        self.resolve(name).filter(|entry| mode.allows(&entry.spec))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn advertised(&self, mode: AccessMode) -> Vec<ToolSpec> {
        self.tools
            .values()
            .filter(|entry| mode.allows(&entry.spec))
            .map(|entry| entry.spec.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;

    fn spec(name: &str, mutating: bool) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: format!("{name} tool"),
            parameters: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
            mutating,
        }
    }

    #[test]
    fn re_registration_overwrites() {
        let mut registry = ToolRegistry::new();
        registry.register(spec("echo", false), |_: &Args| -> Result<Value> { Ok(json!(1)) });
        registry.register(spec("echo", false), |_: &Args| -> Result<Value> { Ok(json!(2)) });

        assert_eq!(registry.len(), 1);
        let out = registry
            .resolve("echo")
            .expect("registered")
            .tool()
            .call(&Args::new())
            .expect("call");
        assert_eq!(out, json!(2));
    }

    #[test]
    fn read_only_mode_hides_mutating_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(spec("read_file", false), |_: &Args| -> Result<Value> { Ok(json!(null)) });
        registry.register(spec("write_file", true), |_: &Args| -> Result<Value> { Ok(json!(null)) });

        let names: Vec<String> = registry
            .advertised(AccessMode::ReadOnly)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["read_file"]);
        assert!(registry.resolve_in("write_file", AccessMode::ReadOnly).is_none());
        assert!(registry.resolve_in("write_file", AccessMode::Full).is_some());
        assert_eq!(registry.list(), vec!["read_file", "write_file"]);
    }

    #[test]
    fn schema_violations_are_reported() {
        let mut registry = ToolRegistry::new();
        registry.register(spec("read_file", false), |_: &Args| -> Result<Value> { Ok(json!(null)) });
        let entry = registry.resolve("read_file").expect("registered");

        assert!(entry.schema_violations(&Args::new()).len() == 1);
        let mut ok = Args::new();
        ok.insert("path".to_string(), json!("a.py"));
        assert!(entry.schema_violations(&ok).is_empty());
    }
}

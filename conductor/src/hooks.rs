//! Hook map: which follow-up actions run after a successful action.
//!
//! Triggers are either an action name (`write_file`) or an event name
//! (`on_write`). An action fires its own entry first, then the entry of the
//! event it belongs to.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::io::atomic::write_atomic;

pub type HookMap = BTreeMap<String, Vec<String>>;

pub fn default_hook_map() -> HookMap {
    ["on_write", "on_edit", "on_create_test"]
        .into_iter()
        .map(|trigger| (trigger.to_string(), vec!["run_tests".to_string()]))
        .collect()
}

/// Event name an action belongs to, if any.
pub fn event_alias(action: &str) -> Option<&'static str> {
    match action {
        "write_file" => Some("on_write"),
        "edit_file_line" | "edit_file" => Some("on_edit"),
        "create_test" => Some("on_create_test"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct HookEngine {
    path: PathBuf,
    map: HookMap,
}

impl HookEngine {
    /// In-memory engine that is never written to disk unless saved.
    pub fn with_map(path: impl Into<PathBuf>, map: HookMap) -> Self {
        Self {
            path: path.into(),
            map,
        }
    }

    /// Load the hook file, or install and persist the default map.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no hook file, installing defaults");
            let engine = Self::with_map(path, default_hook_map());
            engine.save()?;
            return Ok(engine);
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let map: HookMap =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        debug!(triggers = map.len(), "loaded hook map");
        Ok(Self::with_map(path, map))
    }

    pub fn save(&self) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(&self.map).context("serialize hook map")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn map(&self) -> &HookMap {
        &self.map
    }

    /// Replace the hooks for one trigger. In memory only until [`save`](Self::save).
    pub fn set(&mut self, trigger: impl Into<String>, hooks: Vec<String>) {
        self.map.insert(trigger.into(), hooks);
    }

    /// Follow-up actions for `action`, in order, without duplicates.
    pub fn hooks_for(&self, action: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let exact = self.map.get(action);
        let event = event_alias(action).and_then(|alias| self.map.get(alias));
        for hook in exact.into_iter().chain(event).flatten() {
            let hook = hook.as_str();
            if !out.contains(&hook) {
                out.push(hook);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_installs_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".agent_hooks.json");
        let engine = HookEngine::load(&path).expect("load");

        assert!(path.is_file());
        assert_eq!(engine.map(), &default_hook_map());
        assert_eq!(engine.hooks_for("write_file"), vec!["run_tests"]);
        assert!(engine.hooks_for("read_file").is_empty());
    }

    #[test]
    fn save_then_load_is_identical() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("hooks.json");
        let mut engine = HookEngine::with_map(&path, HookMap::new());
        engine.set("on_write", vec!["run_tests".to_string()]);
        engine.set(
            "git_commit",
            vec!["run_command".to_string(), "list_directory".to_string()],
        );
        engine.save().expect("save");

        let loaded = HookEngine::load(&path).expect("load");
        assert_eq!(loaded.map(), engine.map());
    }

    #[test]
    fn exact_entry_precedes_event_entry() {
        let mut map = HookMap::new();
        map.insert(
            "write_file".to_string(),
            vec!["list_directory".to_string(), "run_tests".to_string()],
        );
        map.insert("on_write".to_string(), vec!["run_tests".to_string()]);
        let engine = HookEngine::with_map("unused.json", map);

        assert_eq!(
            engine.hooks_for("write_file"),
            vec!["list_directory", "run_tests"]
        );
    }

    #[test]
    fn unknown_trigger_has_no_hooks() {
        let engine = HookEngine::with_map("unused.json", default_hook_map());
        assert!(engine.hooks_for("does_not_exist").is_empty());
    }
}

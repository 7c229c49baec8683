//! File store rooted at the project directory.
//!
//! Every path handed to a [`Workspace`] is relative to the project root.
//! Absolute paths and `..` components are rejected before touching disk.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

/// One entry returned by [`Workspace::list`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

pub trait Workspace {
    fn root(&self) -> &Path;
    fn read(&self, rel: &str) -> Result<String>;
    /// Replace the file, creating parent directories.
    fn write(&self, rel: &str, contents: &str) -> Result<()>;
    fn append(&self, rel: &str, contents: &str) -> Result<()>;
    fn copy(&self, from: &str, to: &str) -> Result<()>;
    fn exists(&self, rel: &str) -> bool;
    /// Immediate children of a directory, sorted by name.
    fn list(&self, rel: &str) -> Result<Vec<DirEntry>>;
    /// All files below `rel`, relative to the root, sorted. Hidden entries are skipped.
    fn files(&self, rel: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        Ok(self.root.join(clean_relative(rel)?))
    }
}

/// Normalize a user-supplied relative path, refusing anything that could leave the root.
pub fn clean_relative(rel: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(rel.trim()).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(anyhow!("path '{rel}' escapes the project root"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("path '{rel}' must be relative to the project root"));
            }
        }
    }
    Ok(out)
}

impl Workspace for LocalWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, rel: &str) -> Result<String> {
        let path = self.resolve(rel)?;
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        debug!(path = %path.display(), bytes = contents.len(), "write file");
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    fn append(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("append {}", path.display()))
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::copy(&src, &dst)
            .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
        Ok(())
    }

    fn exists(&self, rel: &str) -> bool {
        self.resolve(rel).map(|p| p.exists()).unwrap_or(false)
    }

    fn list(&self, rel: &str) -> Result<Vec<DirEntry>> {
        let path = self.resolve(rel)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&path).with_context(|| format!("list {}", path.display()))? {
            let entry = entry.with_context(|| format!("list {}", path.display()))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type().map(|t| t.is_dir()).unwrap_or(false),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn files(&self, rel: &str) -> Result<Vec<String>> {
        let start = clean_relative(rel)?;
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let abs = self.root.join(&dir);
            if abs.is_file() {
                out.push(to_slash(&dir));
                continue;
            }
            let read = fs::read_dir(&abs).with_context(|| format!("list {}", abs.display()))?;
            for entry in read {
                let entry = entry.with_context(|| format!("list {}", abs.display()))?;
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let child = dir.join(&name);
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    stack.push(child);
                } else {
                    out.push(to_slash(&child));
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_paths_outside_root() {
        assert!(clean_relative("../etc/passwd").is_err());
        assert!(clean_relative("/etc/passwd").is_err());
        assert_eq!(
            clean_relative("./src/../src/calc.py").ok(),
            None,
            "parent components are refused even when they stay inside"
        );
        assert_eq!(
            clean_relative("./src/calc.py").expect("clean"),
            PathBuf::from("src/calc.py")
        );
    }

    #[test]
    fn write_read_append_copy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = LocalWorkspace::new(temp.path());

        ws.write("src/calc.py", "a = 1\n").expect("write");
        ws.append("src/calc.py", "b = 2\n").expect("append");
        ws.copy("src/calc.py", "backup/calc.py").expect("copy");

        assert_eq!(ws.read("backup/calc.py").expect("read"), "a = 1\nb = 2\n");
        assert!(ws.exists("src/calc.py"));
        assert!(!ws.exists("src/missing.py"));
        assert!(ws.read("src/missing.py").is_err());
    }

    #[test]
    fn files_walks_recursively_and_skips_hidden() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = LocalWorkspace::new(temp.path());
        ws.write("src/calc.py", "").expect("write");
        ws.write("tests/test_calc.py", "").expect("write");
        ws.write(".conductor/tool_execution.log", "").expect("write");

        assert_eq!(
            ws.files("").expect("files"),
            vec!["src/calc.py".to_string(), "tests/test_calc.py".to_string()]
        );
        let listing = ws.list("").expect("list");
        assert!(listing.iter().any(|e| e.name == "src" && e.is_dir));
    }
}

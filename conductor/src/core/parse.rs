//! Fallback chain for reading structured data out of model text.
//!
//! Strict parse first, then fenced blocks, then the raw text as a
//! low-confidence result. Parse failure never aborts the caller.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+.-]*)[ \t]*\r?\n(.*?)\r?\n?```").unwrap()
});

/// How a value was recovered from model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    /// The whole text parsed.
    Strict(T),
    /// A fenced block (or embedded object) parsed.
    Extracted(T),
    /// Nothing parsed; the trimmed text is returned as-is.
    Raw(String),
}

impl<T> Parsed<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Parsed::Strict(v) | Parsed::Extracted(v) => Some(v),
            Parsed::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Parsed::Raw(_))
    }
}

/// A fenced code block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    pub lang: Option<String>,
    pub body: String,
}

pub fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    FENCE_RE
        .captures_iter(text)
        .map(|caps| {
            let lang = caps
                .get(1)
                .map(|m| m.as_str().trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty());
            let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            FencedBlock {
                lang,
                body: body.to_string(),
            }
        })
        .collect()
}

/// Try strict JSON, then every fenced block, then the outermost `{...}` span.
pub fn parse_structured<T: DeserializeOwned>(text: &str) -> Parsed<T> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Parsed::Strict(value);
    }

    let blocks = fenced_blocks(trimmed);
    // Blocks tagged json go first; untagged blocks are still worth a try.
    let ordered = blocks
        .iter()
        .filter(|b| b.lang.as_deref() == Some("json"))
        .chain(blocks.iter().filter(|b| b.lang.as_deref() != Some("json")));
    for block in ordered {
        if let Ok(value) = serde_json::from_str::<T>(block.body.trim()) {
            return Parsed::Extracted(value);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
        && let Ok(value) = serde_json::from_str::<T>(&trimmed[start..=end])
    {
        return Parsed::Extracted(value);
    }

    Parsed::Raw(trimmed.to_string())
}

/// Pull code out of a model reply.
///
/// Prefers a block tagged with `lang`, then the first fenced block, then the
/// whole trimmed reply. Returns `None` only for an empty reply.
pub fn extract_code(text: &str, lang: Option<&str>) -> Option<String> {
    let blocks = fenced_blocks(text);
    let preferred = lang.and_then(|lang| {
        blocks
            .iter()
            .find(|b| b.lang.as_deref() == Some(lang.to_ascii_lowercase().as_str()))
    });
    if let Some(block) = preferred.or_else(|| blocks.first()) {
        let body = block.body.trim_end();
        if body.trim().is_empty() {
            return None;
        }
        return Some(format!("{body}\n"));
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(format!("{trimmed}\n"))
}

/// Map a file extension to the fence tag a model usually emits for it.
pub fn fence_language(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext)?;
    let lang = match ext.to_ascii_lowercase().as_str() {
        "py" => "python",
        "rs" => "rust",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" => "typescript",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "html" | "htm" => "html",
        "css" => "css",
        "sh" => "bash",
        "md" => "markdown",
        _ => return None,
    };
    Some(lang)
}

//! File capabilities. Every invocation resolves its path inside the
//! workspace root and reports failures as `ERROR:` text results.

use crate::{Capability, required_str, resolve_path};
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde_json::{Value, json};
use std::path::PathBuf;

/// Files larger than this are refused rather than truncated, so the model
/// never reasons over a silently incomplete view.
const READ_MAX_BYTES: u64 = 1_000_000;
const LIST_MAX_ENTRIES: usize = 200;
const SEARCH_MAX_MATCHES: usize = 50;
const SEARCH_LINE_MAX_CHARS: usize = 200;

fn path_schema(extra: Value) -> Value {
    let mut properties = json!({
        "path": {"type": "string", "description": "Path relative to the workspace root"}
    });
    if let (Some(props), Some(extra)) = (properties.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            props.insert(k.clone(), v.clone());
        }
    }
    json!({"type": "object", "properties": properties, "required": ["path"]})
}

pub struct ReadFile {
    workspace: PathBuf,
}

impl ReadFile {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Capability for ReadFile {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read the full contents of a text file"
    }

    fn parameters(&self) -> Value {
        path_schema(json!({}))
    }

    fn invoke(&self, args: &Value) -> String {
        let raw = match required_str(args, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let path = match resolve_path(&self.workspace, raw) {
            Ok(p) => p,
            Err(e) => return e,
        };
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() > READ_MAX_BYTES => {
                return format!("ERROR: file too large to read: {raw} ({} bytes)", meta.len());
            }
            Ok(meta) if meta.is_dir() => {
                return format!("ERROR: {raw} is a directory, not a file");
            }
            Ok(_) => {}
            Err(e) => return format!("ERROR: cannot read {raw}: {e}"),
        }
        match std::fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => format!("ERROR: cannot read {raw}: {e}"),
        }
    }
}

pub struct GetFileInfo {
    workspace: PathBuf,
}

impl GetFileInfo {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Capability for GetFileInfo {
    fn name(&self) -> &'static str {
        "get_file_info"
    }

    fn description(&self) -> &'static str {
        "Get size, kind, and modification time of a file or directory"
    }

    fn parameters(&self) -> Value {
        path_schema(json!({}))
    }

    fn invoke(&self, args: &Value) -> String {
        let raw = match required_str(args, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let path = match resolve_path(&self.workspace, raw) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => return format!("ERROR: cannot stat {raw}: {e}"),
        };
        let kind = if meta.is_dir() { "directory" } else { "file" };
        let modified = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
            .unwrap_or_else(|_| "unknown".to_string());
        format!(
            "OK: {raw}: {kind}, {} bytes, modified {modified}",
            meta.len()
        )
    }
}

pub struct ListDirectory {
    workspace: PathBuf,
}

impl ListDirectory {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Capability for ListDirectory {
    fn name(&self) -> &'static str {
        "list_directory"
    }

    fn description(&self) -> &'static str {
        "List the entries of a directory (directories get a trailing slash)"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory relative to the workspace root; defaults to the root"
                }
            },
            "required": []
        })
    }

    fn invoke(&self, args: &Value) -> String {
        let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = match resolve_path(&self.workspace, raw) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let entries = match std::fs::read_dir(&path) {
            Ok(iter) => iter,
            Err(e) => return format!("ERROR: cannot list {raw}: {e}"),
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                name
            })
            .collect();
        names.sort();
        if names.is_empty() {
            return "(empty directory)".to_string();
        }
        let total = names.len();
        if total > LIST_MAX_ENTRIES {
            names.truncate(LIST_MAX_ENTRIES);
            names.push(format!("... ({} more entries)", total - LIST_MAX_ENTRIES));
        }
        names.join("\n")
    }
}

pub struct WriteFile {
    workspace: PathBuf,
}

impl WriteFile {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Capability for WriteFile {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &'static str {
        "Create or overwrite a file with the given content"
    }

    fn parameters(&self) -> Value {
        path_schema(json!({
            "content": {"type": "string", "description": "Full new file content"}
        }))
    }

    fn invoke(&self, args: &Value) -> String {
        let raw = match required_str(args, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let content = match required_str(args, "content") {
            Ok(c) => c,
            Err(e) => return e,
        };
        let path = match resolve_path(&self.workspace, raw) {
            Ok(p) => p,
            Err(e) => return e,
        };
        if let Some(parent) = path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            return format!("ERROR: cannot create parent directories for {raw}: {e}");
        }
        match std::fs::write(&path, content) {
            Ok(()) => format!("OK: wrote {} bytes to {raw}", content.len()),
            Err(e) => format!("ERROR: cannot write {raw}: {e}"),
        }
    }
}

pub struct PatchFile {
    workspace: PathBuf,
}

impl PatchFile {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Capability for PatchFile {
    fn name(&self) -> &'static str {
        "patch_file"
    }

    fn description(&self) -> &'static str {
        "Replace one unique occurrence of old text with new text in a file"
    }

    fn parameters(&self) -> Value {
        path_schema(json!({
            "old": {"type": "string", "description": "Exact text to replace; must occur exactly once"},
            "new": {"type": "string", "description": "Replacement text"}
        }))
    }

    fn invoke(&self, args: &Value) -> String {
        let raw = match required_str(args, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let old = match required_str(args, "old") {
            Ok(o) => o,
            Err(e) => return e,
        };
        let new = args.get("new").and_then(Value::as_str).unwrap_or_default();
        let path = match resolve_path(&self.workspace, raw) {
            Ok(p) => p,
            Err(e) => return e,
        };
        apply_patch(&path, raw, old, new)
    }
}

/// Unique-match replacement. Zero matches and multiple matches are both
/// refused so a patch can never land somewhere the model did not intend.
pub fn apply_patch(path: &std::path::Path, display: &str, old: &str, new: &str) -> String {
    if old.is_empty() {
        return "ERROR: argument 'old' must not be empty".to_string();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => return format!("ERROR: cannot read {display}: {e}"),
    };
    let occurrences = content.matches(old).count();
    match occurrences {
        0 => format!(
            "ERROR: old text not found in {display}; check exact whitespace and indentation"
        ),
        1 => {
            let patched = content.replacen(old, new, 1);
            match std::fs::write(path, &patched) {
                Ok(()) => format!(
                    "OK: replaced {} chars with {} chars in {display}",
                    old.chars().count(),
                    new.chars().count()
                ),
                Err(e) => format!("ERROR: cannot write {display}: {e}"),
            }
        }
        n => format!("ERROR: old text occurs {n} times in {display}; it must match exactly once"),
    }
}

pub struct DeleteFile {
    workspace: PathBuf,
}

impl DeleteFile {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Capability for DeleteFile {
    fn name(&self) -> &'static str {
        "delete_file"
    }

    fn description(&self) -> &'static str {
        "Delete a single file"
    }

    fn parameters(&self) -> Value {
        path_schema(json!({}))
    }

    fn invoke(&self, args: &Value) -> String {
        let raw = match required_str(args, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let path = match resolve_path(&self.workspace, raw) {
            Ok(p) => p,
            Err(e) => return e,
        };
        match std::fs::remove_file(&path) {
            Ok(()) => format!("OK: deleted {raw}"),
            Err(e) => format!("ERROR: cannot delete {raw}: {e}"),
        }
    }
}

pub struct SearchInFiles {
    workspace: PathBuf,
}

impl SearchInFiles {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Capability for SearchInFiles {
    fn name(&self) -> &'static str {
        "search_in_files"
    }

    fn description(&self) -> &'static str {
        "Search workspace files for a literal text pattern, line by line"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Literal text to search for"},
                "path": {
                    "type": "string",
                    "description": "Subdirectory to search; defaults to the workspace root"
                }
            },
            "required": ["pattern"]
        })
    }

    fn invoke(&self, args: &Value) -> String {
        let pattern = match required_str(args, "pattern") {
            Ok(p) => p,
            Err(e) => return e,
        };
        if pattern.is_empty() {
            return "ERROR: argument 'pattern' must not be empty".to_string();
        }
        let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let root = match resolve_path(&self.workspace, raw) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let mut matches = Vec::new();
        let mut truncated = false;
        // Respects .gitignore, skips hidden files, same view the planner has.
        for entry in WalkBuilder::new(&root).build().filter_map(|e| e.ok()) {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            if entry.metadata().map(|m| m.len() > READ_MAX_BYTES).unwrap_or(true) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let rel = entry
                .path()
                .strip_prefix(&self.workspace)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            for (lineno, line) in content.lines().enumerate() {
                if line.contains(pattern) {
                    if matches.len() >= SEARCH_MAX_MATCHES {
                        truncated = true;
                        break;
                    }
                    let shown =
                        shoestring_core::truncate_chars(line.trim_end(), SEARCH_LINE_MAX_CHARS);
                    matches.push(format!("{rel}:{}: {shown}", lineno + 1));
                }
            }
            if truncated {
                break;
            }
        }

        if matches.is_empty() {
            return format!("No matches for '{pattern}'");
        }
        if truncated {
            matches.push(format!("... (stopped after {SEARCH_MAX_MATCHES} matches)"));
        }
        matches.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CapabilityRegistry;
    use crate::default_registry;
    use serde_json::json;
    use shoestring_core::ToolCall;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, CapabilityRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = default_registry(dir.path(), Duration::from_secs(5));
        (dir, registry)
    }

    fn call(registry: &CapabilityRegistry, name: &str, args: Value) -> String {
        registry.invoke(&ToolCall {
            name: name.to_string(),
            args,
        })
    }

    #[test]
    fn write_then_read_round_trip() {
        let (_dir, registry) = setup();
        let out = call(
            &registry,
            "write_file",
            json!({"path": "src/lib.rs", "content": "pub fn add() {}\n"}),
        );
        assert!(out.starts_with("OK:"), "{out}");
        let body = call(&registry, "read_file", json!({"path": "src/lib.rs"}));
        assert_eq!(body, "pub fn add() {}\n");
    }

    #[test]
    fn patch_requires_a_unique_match() {
        let (_dir, registry) = setup();
        call(
            &registry,
            "write_file",
            json!({"path": "a.txt", "content": "one two one"}),
        );

        let ambiguous = call(
            &registry,
            "patch_file",
            json!({"path": "a.txt", "old": "one", "new": "1"}),
        );
        assert!(ambiguous.contains("occurs 2 times"), "{ambiguous}");

        let missing = call(
            &registry,
            "patch_file",
            json!({"path": "a.txt", "old": "three", "new": "3"}),
        );
        assert!(missing.contains("not found"), "{missing}");

        let ok = call(
            &registry,
            "patch_file",
            json!({"path": "a.txt", "old": "two", "new": "2"}),
        );
        assert!(ok.starts_with("OK:"), "{ok}");
        let body = call(&registry, "read_file", json!({"path": "a.txt"}));
        assert_eq!(body, "one 2 one");
    }

    #[test]
    fn patch_rejects_empty_old_text() {
        let (_dir, registry) = setup();
        call(
            &registry,
            "write_file",
            json!({"path": "a.txt", "content": "x"}),
        );
        let out = call(
            &registry,
            "patch_file",
            json!({"path": "a.txt", "old": "", "new": "y"}),
        );
        assert!(out.starts_with("ERROR:"), "{out}");
    }

    #[test]
    fn traversal_is_rejected_by_every_file_tool() {
        let (_dir, registry) = setup();
        for name in ["read_file", "get_file_info", "delete_file"] {
            let out = call(&registry, name, json!({"path": "../secrets"}));
            assert!(out.contains("escapes the workspace"), "{name}: {out}");
        }
        let out = call(
            &registry,
            "write_file",
            json!({"path": "/etc/hosts", "content": ""}),
        );
        assert!(out.contains("absolute paths"), "{out}");
    }

    #[test]
    fn list_directory_marks_subdirectories() {
        let (dir, registry) = setup();
        std::fs::create_dir(dir.path().join("src")).expect("mkdir");
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").expect("write");
        let out = call(&registry, "list_directory", json!({}));
        assert_eq!(out, "Cargo.toml\nsrc/");
    }

    #[test]
    fn search_reports_file_line_and_text() {
        let (_dir, registry) = setup();
        call(
            &registry,
            "write_file",
            json!({"path": "main.py", "content": "import os\n\ndef handler():\n    pass\n"}),
        );
        let out = call(&registry, "search_in_files", json!({"pattern": "handler"}));
        assert_eq!(out, "main.py:3: def handler():");

        let none = call(&registry, "search_in_files", json!({"pattern": "zzz"}));
        assert_eq!(none, "No matches for 'zzz'");
    }

    #[test]
    fn missing_file_reads_as_error_result() {
        let (_dir, registry) = setup();
        let out = call(&registry, "read_file", json!({"path": "nope.txt"}));
        assert!(shoestring_core::result_is_error(&out), "{out}");
    }

    #[test]
    fn file_info_reports_kind_and_size() {
        let (_dir, registry) = setup();
        call(
            &registry,
            "write_file",
            json!({"path": "data.bin", "content": "12345"}),
        );
        let out = call(&registry, "get_file_info", json!({"path": "data.bin"}));
        assert!(out.starts_with("OK: data.bin: file, 5 bytes"), "{out}");
    }
}

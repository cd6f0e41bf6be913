pub mod fs;
pub mod shell;

use serde_json::Value;
use shoestring_core::{FunctionDefinition, ToolCall, ToolDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const CATEGORY_FILE_READ: &str = "file_read";
pub const CATEGORY_FILE_WRITE: &str = "file_write";
pub const CATEGORY_CODE_SEARCH: &str = "code_search";
pub const CATEGORY_SHELL: &str = "shell";

/// A capability the executor can invoke. Implementations never panic and
/// never return `Err` across this boundary: every failure is reported as a
/// text result starting with `ERROR:` so the model can read it and react.
pub trait Capability: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema for the arguments object, in OpenAI function format.
    fn parameters(&self) -> Value;
    fn invoke(&self, args: &Value) -> String;
}

#[derive(Debug, Clone)]
pub struct ToolCategory {
    pub name: String,
    pub description: String,
    pub tools: Vec<String>,
}

/// Name-keyed capability set, grouped into coarse categories so the tool
/// selector can reason about groups instead of individual tools.
#[derive(Default)]
pub struct CapabilityRegistry {
    caps: BTreeMap<String, Arc<dyn Capability>>,
    categories: BTreeMap<String, ToolCategory>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_category(&mut self, name: &str, description: &str) {
        self.categories
            .entry(name.to_string())
            .or_insert_with(|| ToolCategory {
                name: name.to_string(),
                description: description.to_string(),
                tools: Vec::new(),
            });
    }

    pub fn register(&mut self, category: &str, cap: Arc<dyn Capability>) {
        if !self.categories.contains_key(category) {
            self.add_category(category, "");
        }
        if let Some(cat) = self.categories.get_mut(category) {
            let name = cap.name().to_string();
            if !cat.tools.contains(&name) {
                cat.tools.push(name);
            }
        }
        self.caps.insert(cap.name().to_string(), cap);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.caps.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.caps.keys().cloned().collect()
    }

    pub fn categories(&self) -> impl Iterator<Item = &ToolCategory> {
        self.categories.values()
    }

    pub fn tools_in_categories(&self, categories: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for cat in categories {
            if let Some(cat) = self.categories.get(cat) {
                for tool in &cat.tools {
                    if !out.contains(tool) {
                        out.push(tool.clone());
                    }
                }
            }
        }
        out
    }

    /// Tools in `file_write` mutate the workspace; their results feed the
    /// touched-file ledger in the direct tool loop.
    pub fn is_write_class(&self, name: &str) -> bool {
        self.categories
            .get(CATEGORY_FILE_WRITE)
            .is_some_and(|cat| cat.tools.iter().any(|t| t == name))
    }

    /// Dispatch a call. Unknown tool names come back as an `ERROR:` result
    /// rather than an `Err`: the model asked for the tool, so the model gets
    /// told it does not exist.
    pub fn invoke(&self, call: &ToolCall) -> String {
        match self.caps.get(&call.name) {
            Some(cap) => cap.invoke(&call.args),
            None => format!("ERROR: unknown tool '{}'", call.name),
        }
    }

    /// Function definitions for the given tool names, in the order given.
    /// Names with no registered capability are silently skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| self.caps.get(name))
            .map(|cap| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: cap.name().to_string(),
                    description: cap.description().to_string(),
                    parameters: cap.parameters(),
                },
            })
            .collect()
    }

    pub fn all_definitions(&self) -> Vec<ToolDefinition> {
        self.definitions_for(&self.names())
    }

    /// `(name, description)` pairs for the given tools, for prompt indexes.
    pub fn descriptions_for(&self, names: &[String]) -> Vec<(String, String)> {
        names
            .iter()
            .filter_map(|name| self.caps.get(name))
            .map(|cap| (cap.name().to_string(), cap.description().to_string()))
            .collect()
    }
}

/// The built-in capability set, rooted at `workspace`.
pub fn default_registry(workspace: &Path, command_timeout: Duration) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.add_category(CATEGORY_FILE_READ, "Read file contents and inspect the workspace");
    registry.add_category(CATEGORY_FILE_WRITE, "Create, modify, and delete files");
    registry.add_category(CATEGORY_CODE_SEARCH, "Search for text across workspace files");
    registry.add_category(CATEGORY_SHELL, "Run shell commands in the workspace");

    let ws = workspace.to_path_buf();
    registry.register(CATEGORY_FILE_READ, Arc::new(fs::ReadFile::new(ws.clone())));
    registry.register(CATEGORY_FILE_READ, Arc::new(fs::GetFileInfo::new(ws.clone())));
    registry.register(CATEGORY_FILE_READ, Arc::new(fs::ListDirectory::new(ws.clone())));
    registry.register(CATEGORY_FILE_WRITE, Arc::new(fs::WriteFile::new(ws.clone())));
    registry.register(CATEGORY_FILE_WRITE, Arc::new(fs::PatchFile::new(ws.clone())));
    registry.register(CATEGORY_FILE_WRITE, Arc::new(fs::DeleteFile::new(ws.clone())));
    registry.register(CATEGORY_CODE_SEARCH, Arc::new(fs::SearchInFiles::new(ws.clone())));
    registry.register(
        CATEGORY_SHELL,
        Arc::new(shell::RunCommand::new(ws, command_timeout)),
    );
    registry
}

/// Resolve a model-supplied path inside the workspace. Absolute paths and
/// `..` traversal are rejected with an `ERROR:` message.
pub(crate) fn resolve_path(
    workspace: &Path,
    raw: &str,
) -> std::result::Result<std::path::PathBuf, String> {
    let rel = Path::new(raw);
    if rel.is_absolute() {
        return Err(format!("ERROR: absolute paths are not allowed: {raw}"));
    }
    for component in rel.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(format!("ERROR: path escapes the workspace: {raw}"));
        }
    }
    Ok(workspace.join(rel))
}

pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> std::result::Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("ERROR: missing required argument '{key}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> (tempfile::TempDir, CapabilityRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = default_registry(dir.path(), Duration::from_secs(5));
        (dir, registry)
    }

    #[test]
    fn unknown_tool_reports_error_result() {
        let (_dir, registry) = registry();
        let out = registry.invoke(&ToolCall {
            name: "launch_missiles".to_string(),
            args: json!({}),
        });
        assert!(shoestring_core::result_is_error(&out));
        assert!(out.contains("launch_missiles"));
    }

    #[test]
    fn write_class_covers_exactly_the_file_write_category() {
        let (_dir, registry) = registry();
        assert!(registry.is_write_class("write_file"));
        assert!(registry.is_write_class("patch_file"));
        assert!(registry.is_write_class("delete_file"));
        assert!(!registry.is_write_class("read_file"));
        assert!(!registry.is_write_class("run_command"));
    }

    #[test]
    fn definitions_skip_unknown_names_and_keep_order() {
        let (_dir, registry) = registry();
        let defs = registry.definitions_for(&[
            "patch_file".to_string(),
            "no_such_tool".to_string(),
            "read_file".to_string(),
        ]);
        let names: Vec<_> = defs.iter().map(|d| d.function.name.as_str()).collect();
        assert_eq!(names, vec!["patch_file", "read_file"]);
        assert_eq!(defs[0].tool_type, "function");
    }

    #[test]
    fn category_expansion_deduplicates() {
        let (_dir, registry) = registry();
        let tools = registry.tools_in_categories(&[
            "file_read".to_string(),
            "file_read".to_string(),
            "shell".to_string(),
        ]);
        assert_eq!(
            tools,
            vec!["read_file", "get_file_info", "list_directory", "run_command"]
        );
    }

    #[test]
    fn path_resolution_rejects_escapes() {
        let ws = Path::new("/tmp/ws");
        assert!(resolve_path(ws, "src/main.rs").is_ok());
        assert!(resolve_path(ws, "../outside").is_err());
        assert!(resolve_path(ws, "a/../../outside").is_err());
        assert!(resolve_path(ws, "/etc/passwd").is_err());
    }
}

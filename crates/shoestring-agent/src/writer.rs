//! Deterministic writer: applies an [`EditAction`] through the capability
//! registry. No model involvement, just mechanical calls and
//! prefix-matched results.

use serde_json::json;
use shoestring_core::{EditAction, ToolCall, WriteResult, result_is_ok, truncate_chars};
use shoestring_tools::CapabilityRegistry;
use std::collections::BTreeMap;

const INDEX_SNIPPET_CHARS: usize = 200;

/// Apply one action. Returns the outcome plus file-index updates for files
/// that actually changed.
pub(crate) fn apply_action(
    registry: &CapabilityRegistry,
    action: &EditAction,
    task_id: u64,
) -> (WriteResult, BTreeMap<String, String>) {
    let mut index_updates = BTreeMap::new();
    let result = match action {
        EditAction::None { summary } => WriteResult {
            success: true,
            message: if summary.is_empty() {
                "No file changes needed.".to_string()
            } else {
                summary.clone()
            },
            file: None,
        },

        EditAction::Patch { file, old, new } => {
            if file.is_empty() || old.is_empty() {
                WriteResult::failure("ERROR: patch action missing 'file' or 'old'")
            } else {
                let message = registry.invoke(&ToolCall {
                    name: "patch_file".to_string(),
                    args: json!({"path": file, "old": old, "new": new}),
                });
                let success = result_is_ok(&message);
                if success {
                    index_updates.insert(file.clone(), format!("Patched by task {task_id}"));
                }
                WriteResult {
                    success,
                    message,
                    file: Some(file.clone()),
                }
            }
        }

        EditAction::MultiPatch { file, patches } => {
            if file.is_empty() || patches.is_empty() {
                WriteResult::failure("ERROR: multi_patch action missing 'file' or 'patches'")
            } else {
                // Ordered, prefix-only application: the first failing hunk
                // aborts everything after it.
                let mut applied = 0usize;
                let mut failure: Option<String> = None;
                for hunk in patches {
                    let message = registry.invoke(&ToolCall {
                        name: "patch_file".to_string(),
                        args: json!({"path": file, "old": hunk.old, "new": hunk.new}),
                    });
                    if result_is_ok(&message) {
                        applied += 1;
                    } else {
                        failure = Some(message);
                        break;
                    }
                }
                match failure {
                    None => {
                        index_updates
                            .insert(file.clone(), format!("Patched by task {task_id}"));
                        WriteResult {
                            success: true,
                            message: format!("OK: applied {applied} hunks to {file}"),
                            file: Some(file.clone()),
                        }
                    }
                    Some(msg) => WriteResult {
                        success: false,
                        message: format!(
                            "ERROR: applied {applied}/{} hunks to {file}; hunk {} failed: {msg}",
                            patches.len(),
                            applied + 1
                        ),
                        file: Some(file.clone()),
                    },
                }
            }
        }

        EditAction::Write { file, content } => {
            if file.is_empty() {
                WriteResult::failure("ERROR: write action missing 'file'")
            } else {
                let message = registry.invoke(&ToolCall {
                    name: "write_file".to_string(),
                    args: json!({"path": file, "content": content}),
                });
                let success = result_is_ok(&message);
                if success {
                    index_updates.insert(
                        file.clone(),
                        truncate_chars(content, INDEX_SNIPPET_CHARS).to_string(),
                    );
                }
                WriteResult {
                    success,
                    message,
                    file: Some(file.clone()),
                }
            }
        }
    };
    (result, index_updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoestring_core::PatchHunk;
    use shoestring_tools::default_registry;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, CapabilityRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = default_registry(dir.path(), Duration::from_secs(5));
        (dir, registry)
    }

    #[test]
    fn patch_action_lands_and_updates_the_index() {
        let (dir, registry) = setup();
        std::fs::write(dir.path().join("a.py"), "x=1\n").expect("write");
        let action = EditAction::Patch {
            file: "a.py".to_string(),
            old: "x=1".to_string(),
            new: "x=2".to_string(),
        };
        let (result, updates) = apply_action(&registry, &action, 7);
        assert!(result.success, "{}", result.message);
        assert_eq!(result.file.as_deref(), Some("a.py"));
        assert_eq!(updates.get("a.py").map(String::as_str), Some("Patched by task 7"));
        let content = std::fs::read_to_string(dir.path().join("a.py")).expect("read");
        assert_eq!(content, "x=2\n");
    }

    #[test]
    fn ambiguous_patch_fails_and_leaves_the_file_untouched() {
        let (dir, registry) = setup();
        std::fs::write(dir.path().join("a.py"), "x=1\nx=1\n").expect("write");
        let action = EditAction::Patch {
            file: "a.py".to_string(),
            old: "x=1".to_string(),
            new: "x=2".to_string(),
        };
        let (result, updates) = apply_action(&registry, &action, 1);
        assert!(!result.success);
        assert!(updates.is_empty());
        let content = std::fs::read_to_string(dir.path().join("a.py")).expect("read");
        assert_eq!(content, "x=1\nx=1\n");
    }

    #[test]
    fn multi_patch_stops_at_the_first_failing_hunk() {
        let (dir, registry) = setup();
        std::fs::write(dir.path().join("m.py"), "a\nmissing?\nc\n").expect("write");
        let action = EditAction::MultiPatch {
            file: "m.py".to_string(),
            patches: vec![
                PatchHunk {
                    old: "a".to_string(),
                    new: "A".to_string(),
                },
                PatchHunk {
                    old: "zzz".to_string(),
                    new: "Z".to_string(),
                },
                PatchHunk {
                    old: "c".to_string(),
                    new: "C".to_string(),
                },
            ],
        };
        let (result, _) = apply_action(&registry, &action, 1);
        assert!(!result.success);
        assert!(result.message.contains("applied 1/3"), "{}", result.message);
        // Hunk 1 applied, hunk 3 never attempted.
        let content = std::fs::read_to_string(dir.path().join("m.py")).expect("read");
        assert_eq!(content, "A\nmissing?\nc\n");
    }

    #[test]
    fn multi_patch_applies_all_hunks_when_clean() {
        let (dir, registry) = setup();
        std::fs::write(dir.path().join("m.py"), "a b c\n").expect("write");
        let action = EditAction::MultiPatch {
            file: "m.py".to_string(),
            patches: vec![
                PatchHunk {
                    old: "a".to_string(),
                    new: "1".to_string(),
                },
                PatchHunk {
                    old: "c".to_string(),
                    new: "3".to_string(),
                },
            ],
        };
        let (result, _) = apply_action(&registry, &action, 1);
        assert!(result.success, "{}", result.message);
        let content = std::fs::read_to_string(dir.path().join("m.py")).expect("read");
        assert_eq!(content, "1 b 3\n");
    }

    #[test]
    fn write_action_creates_the_file() {
        let (dir, registry) = setup();
        let action = EditAction::Write {
            file: "pkg/new.py".to_string(),
            content: "print('hi')\n".to_string(),
        };
        let (result, updates) = apply_action(&registry, &action, 1);
        assert!(result.success, "{}", result.message);
        assert!(updates.contains_key("pkg/new.py"));
        let content = std::fs::read_to_string(dir.path().join("pkg/new.py")).expect("read");
        assert_eq!(content, "print('hi')\n");
    }

    #[test]
    fn none_action_succeeds_with_its_summary() {
        let (_dir, registry) = setup();
        let action = EditAction::None {
            summary: "nothing needed".to_string(),
        };
        let (result, updates) = apply_action(&registry, &action, 1);
        assert!(result.success);
        assert_eq!(result.message, "nothing needed");
        assert!(result.file.is_none());
        assert!(updates.is_empty());
    }

    #[test]
    fn incomplete_actions_fail_without_touching_anything() {
        let (_dir, registry) = setup();
        let (result, _) = apply_action(
            &registry,
            &EditAction::Patch {
                file: String::new(),
                old: "x".to_string(),
                new: "y".to_string(),
            },
            1,
        );
        assert!(!result.success);
        assert!(result.message.starts_with("ERROR:"));
    }
}

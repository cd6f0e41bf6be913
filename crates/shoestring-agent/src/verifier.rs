//! Independent verification that a claimed edit actually landed.
//!
//! The execution stage cannot be trusted to self-report success, so every
//! claimed file change is re-read through the capability registry and
//! checked with an action-specific containment test. Verification is never
//! retried: a failed re-read is an immediate fail.

use serde_json::json;
use shoestring_core::{
    BudgetConfig, EditAction, ToolCall, WriteResult, result_is_error, truncate_chars,
};
use shoestring_tools::CapabilityRegistry;
use std::collections::BTreeMap;

const INDEX_SNIPPET_CHARS: usize = 400;

pub(crate) struct Verification {
    pub passed: bool,
    pub message: String,
    pub index_updates: BTreeMap<String, String>,
}

impl Verification {
    fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            index_updates: BTreeMap::new(),
        }
    }

    fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            index_updates: BTreeMap::new(),
        }
    }
}

/// Verify every action from one execution attempt. All actions must pass;
/// messages are joined in action order.
pub(crate) fn verify_all(
    registry: &CapabilityRegistry,
    budgets: &BudgetConfig,
    actions: &[EditAction],
    write_result: &WriteResult,
) -> Verification {
    if !write_result.success {
        return Verification::fail(write_result.message.clone());
    }
    if actions.is_empty() {
        return Verification::pass(write_result.message.clone());
    }

    let mut passed = true;
    let mut messages = Vec::new();
    let mut index_updates = BTreeMap::new();
    for action in actions {
        let v = verify_action(registry, budgets, action, write_result);
        passed &= v.passed;
        messages.push(v.message);
        index_updates.extend(v.index_updates);
    }
    Verification {
        passed,
        message: messages.join(" | "),
        index_updates,
    }
}

fn verify_action(
    registry: &CapabilityRegistry,
    budgets: &BudgetConfig,
    action: &EditAction,
    write_result: &WriteResult,
) -> Verification {
    let file = match action {
        EditAction::None { summary } => {
            let message = if summary.is_empty() {
                write_result.message.clone()
            } else {
                summary.clone()
            };
            return Verification::pass(message);
        }
        other => match other.target_file() {
            Some(f) => f.to_string(),
            None => return Verification::fail("No file path in write result."),
        },
    };

    let content = registry.invoke(&ToolCall {
        name: "read_file".to_string(),
        args: json!({"path": file}),
    });
    if result_is_error(&content) {
        return Verification::fail(format!("Could not re-read {file}: {content}"));
    }

    let mut verification = match action {
        EditAction::Patch { old, new, .. } => {
            if !new.is_empty() && content.contains(new.as_str()) {
                Verification::pass(format!("Verified: new content present in {file}."))
            } else if !old.is_empty() && content.contains(old.as_str()) {
                Verification::fail(format!(
                    "FAIL: old text still present in {file}; patch did not apply."
                ))
            } else {
                // Known weak point: neither string is present, so the file
                // differs from expectation, but a change clearly occurred.
                // Treated as a pass and flagged in the message.
                Verification::pass(format!(
                    "OK: {file} changed; neither old nor new text found (content drifted, accepting)."
                ))
            }
        }
        EditAction::MultiPatch { patches, .. } => {
            let new_present = patches
                .iter()
                .filter(|h| !h.new.is_empty() && content.contains(h.new.as_str()))
                .count();
            let old_remaining = patches
                .iter()
                .filter(|h| !h.old.is_empty() && content.contains(h.old.as_str()))
                .count();
            if new_present >= 1 && old_remaining == 0 {
                Verification::pass(format!(
                    "Verified: {new_present} replacement(s) present in {file}, none of the old text remains."
                ))
            } else {
                Verification::fail(format!(
                    "FAIL: {file} has {new_present} new string(s) present and {old_remaining} old string(s) remaining."
                ))
            }
        }
        EditAction::Write { content: intended, .. } => {
            let prefix = truncate_chars(intended, budgets.write_verify_prefix_chars);
            if !prefix.is_empty() && content.contains(prefix) {
                Verification::pass(format!("Verified: content present in {file}."))
            } else {
                Verification::fail(format!("FAIL: written content not found in {file}."))
            }
        }
        EditAction::None { .. } => unreachable!("handled above"),
    };

    verification.index_updates.insert(
        file,
        truncate_chars(&content, INDEX_SNIPPET_CHARS).to_string(),
    );
    verification
}

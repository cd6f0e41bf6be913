//! Budgeted context assembly.
//!
//! Builds the smallest useful context string for one executor call, under a
//! hard character budget derived from the executor's token budget. The task
//! description always goes in whole; everything after it competes for what
//! remains and is silently dropped or truncated when the budget runs out.

use shoestring_core::{BudgetConfig, RunState, Subtask, truncate_chars};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Remaining budget below this after the description makes dependency
/// summaries not worth injecting.
const MIN_SUMMARY_BUDGET: usize = 100;
/// Headroom kept when truncating the summary block, so the join separators
/// never push the output over budget.
const BLOCK_HEADROOM: usize = 50;

pub struct ContextAssembler<'a> {
    workspace: &'a Path,
    budgets: &'a BudgetConfig,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(workspace: &'a Path, budgets: &'a BudgetConfig) -> Self {
        Self { workspace, budgets }
    }

    fn budget(&self) -> usize {
        (self.budgets.executor_budget_tokens as f32 * self.budgets.chars_per_token) as usize
    }

    /// Assemble the context for `task`. Never fails; missing or unreadable
    /// sources simply contribute nothing.
    pub fn build(&self, task: &Subtask, state: &RunState) -> String {
        let budget = self.budget();
        let mut parts: Vec<String> = Vec::new();
        let mut injected: BTreeSet<String> = BTreeSet::new();

        // The description is the one part that may exceed the budget on its
        // own: a context that drops the task itself is useless.
        let task_block = format!("=== CURRENT TASK: {} ===\n{}", task.title, task.description);
        let mut remaining = budget.saturating_sub(task_block.len() + 2);
        parts.push(task_block);

        let dep_summaries = self.dependency_summaries(task, state);
        if !dep_summaries.is_empty() && remaining > MIN_SUMMARY_BUDGET {
            let block = format!("=== PRIOR TASK RESULTS ===\n{dep_summaries}");
            let block = truncate_chars(&block, remaining.saturating_sub(BLOCK_HEADROOM));
            remaining = remaining.saturating_sub(block.len() + 2);
            parts.push(block.to_string());
        }

        // Files the task talks about, already sitting in the index.
        let description_lower = task.description.to_lowercase();
        for (name, content) in &state.file_index {
            if remaining < self.budgets.min_snippet_budget_chars {
                break;
            }
            if !mentions_file(&description_lower, name) || injected.contains(name) {
                continue;
            }
            let snippet = format!(
                "[Cached info for {name}]:\n{}",
                truncate_chars(content, self.budgets.file_snippet_max_chars)
            );
            let snippet = truncate_chars(&snippet, remaining).to_string();
            remaining = remaining.saturating_sub(snippet.len() + 2);
            injected.insert(name.clone());
            parts.push(snippet);
        }

        // Explicit planner hints, via cache → direct read → fuzzy match.
        for hint in &task.context_hints {
            if remaining < self.budgets.min_snippet_budget_chars {
                break;
            }
            if injected.contains(hint) {
                continue;
            }
            if let Some(snippet) = self.fetch_snippet(hint, state) {
                let snippet = truncate_chars(&snippet, remaining).to_string();
                remaining = remaining.saturating_sub(snippet.len() + 2);
                injected.insert(hint.clone());
                parts.push(snippet);
            }
        }

        parts.join("\n\n")
    }

    fn dependency_summaries(&self, task: &Subtask, state: &RunState) -> String {
        task.depends_on
            .iter()
            .filter_map(|dep_id| state.plan.find(*dep_id))
            .filter_map(|dep| {
                dep.result_summary.as_ref().map(|summary| {
                    format!(
                        "[Task {} - {}]: {}",
                        dep.id,
                        dep.title,
                        truncate_chars(summary, self.budgets.summary_max_chars)
                    )
                })
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn fetch_snippet(&self, hint: &str, state: &RunState) -> Option<String> {
        let cap = self.budgets.file_snippet_max_chars;

        if let Some(cached) = state.file_index.get(hint) {
            return Some(format!(
                "[Cached info for {hint}]:\n{}",
                truncate_chars(cached, cap)
            ));
        }

        let candidate = self.workspace.join(hint);
        if candidate.is_file()
            && let Ok(content) = std::fs::read_to_string(&candidate)
        {
            return Some(format!(
                "[File snippet: {hint}]\n{}",
                truncate_chars(&content, cap)
            ));
        }

        let matched = self.fuzzy_match(hint)?;
        let content = std::fs::read_to_string(&matched).ok()?;
        let rel = matched
            .strip_prefix(self.workspace)
            .unwrap_or(&matched)
            .display();
        Some(format!(
            "[File snippet: {rel}]\n{}",
            truncate_chars(&content, cap)
        ))
    }

    /// Best workspace file whose name contains the hint, ties broken by
    /// name similarity.
    fn fuzzy_match(&self, hint: &str) -> Option<PathBuf> {
        let needle = hint.to_lowercase();
        ignore::WalkBuilder::new(self.workspace)
            .build()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_lowercase();
                name.contains(&needle)
                    .then(|| (strsim::jaro(&needle, &name), e.into_path()))
            })
            .max_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, path)| path)
    }
}

/// Does the description mention this index key, either as a full path or by
/// bare filename? Matches must sit on a name boundary so `a.py` is not found
/// inside `data.py`.
fn mentions_file(description_lower: &str, key: &str) -> bool {
    let key_lower = key.to_lowercase();
    if contains_anchored(description_lower, &key_lower) {
        return true;
    }
    Path::new(&key_lower)
        .file_name()
        .map(|n| contains_anchored(description_lower, &n.to_string_lossy()))
        .unwrap_or(false)
}

/// Substring search that rejects matches preceded by a filename character,
/// so a short name cannot match inside a longer one.
fn contains_anchored(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let at = from + pos;
        let boundary = haystack[..at]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric() && !matches!(c, '_' | '.' | '-'));
        if boundary {
            return true;
        }
        from = at + needle.len();
    }
    false
}

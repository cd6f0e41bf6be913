//! Skill, rule, and tool selectors.
//!
//! All three share one protocol: show the model a compact numbered index of
//! candidates, ask for a comma-separated subset of numbers (or the literal
//! "none"), parse permissively, and fall back to a stage-safe default on any
//! failure. A selector can narrow the pipeline's focus but can never abort
//! it.

use crate::AgentEngine;
use regex::Regex;
use shoestring_core::{LlmRequest, Subtask, truncate_chars};
use shoestring_defs::{DefCatalog, GENERIC_SKILL_PROMPT};
use std::sync::OnceLock;

const INDEX_PREVIEW_CHARS: usize = 80;
const TASK_PREVIEW_CHARS: usize = 300;

const SKILL_SELECTOR_SYSTEM: &str = "You are a relevance filter for task skills.\n\
\n\
Given a task description and a numbered list of skills, return ONLY the numbers\n\
of skills that describe the kind of work this task is. Most tasks match exactly\n\
one skill. Matching more than one means the task spans several kinds of work.\n\
\n\
Respond with ONLY a comma-separated list of numbers, e.g.:  1,3\n\
If no skill fits, respond with: none\n\
No explanation, no other text.";

const RULE_SELECTOR_SYSTEM: &str = "You are a relevance filter for coding assistant rules.\n\
\n\
Given a task description and a numbered list of rules, return ONLY the numbers\n\
of rules that are directly relevant to completing that specific task.\n\
\n\
Rules are relevant if they constrain HOW the task should be done (coding style,\n\
forbidden patterns, required patterns, language preferences, etc.).\n\
\n\
Respond with ONLY a comma-separated list of numbers, e.g.:  1,3,5\n\
If no rules are relevant, respond with: none\n\
No explanation, no other text.";

const TOOL_SELECTOR_SYSTEM: &str = "You are a relevance filter for assistant tools.\n\
\n\
Given a task description and a numbered list of tools, return ONLY the numbers\n\
of tools the task is likely to need. Include read tools when the task needs\n\
context, write tools only when files must change.\n\
\n\
Respond with ONLY a comma-separated list of numbers, e.g.:  1,2,5\n\
If unsure, respond with: none\n\
No explanation, no other text.";

const CATEGORY_SELECTOR_SYSTEM: &str = "You are a relevance filter for tool categories.\n\
\n\
Given a task description and a numbered list of tool categories, return ONLY\n\
the numbers of categories the task will need.\n\
\n\
Respond with ONLY a comma-separated list of numbers, e.g.:  1,3\n\
If unsure, respond with: none\n\
No explanation, no other text.";

/// Parse a numbered-subset reply into zero-based indices. Non-numeric tokens
/// and out-of-range numbers are ignored; "none" and empty both mean no
/// selection.
pub(crate) fn parse_selection(raw: &str, candidates: usize) -> Vec<usize> {
    static SPLIT_RE: OnceLock<Regex> = OnceLock::new();
    let split = SPLIT_RE.get_or_init(|| Regex::new(r"[,\s]+").expect("valid regex"));

    let raw = raw.trim().to_lowercase();
    if raw.is_empty() || raw == "none" {
        return Vec::new();
    }
    let mut out = Vec::new();
    for token in split.split(&raw) {
        if let Ok(n) = token.parse::<usize>()
            && (1..=candidates).contains(&n)
            && !out.contains(&(n - 1))
        {
            out.push(n - 1);
        }
    }
    out
}

fn numbered_index<'a>(entries: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    entries
        .enumerate()
        .map(|(i, (name, preview))| {
            let preview = truncate_chars(preview, INDEX_PREVIEW_CHARS).replace('\n', " ");
            format!("{}. [{name}] {preview}", i + 1)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn classify(engine: &AgentEngine, system: &str, task_text: &str, index: &str) -> Option<String> {
    let response = engine.llm.complete(&LlmRequest {
        prompt: format!(
            "Task: {}\n\nCandidates:\n{index}",
            truncate_chars(task_text, TASK_PREVIEW_CHARS)
        ),
        system: Some(system.to_string()),
        max_tokens: engine.cfg.budgets.selector_max_tokens,
    });
    match response {
        Ok(r) => Some(r.text),
        Err(e) => {
            engine.observer.warn_log(&format!("selector call failed: {e}"));
            None
        }
    }
}

/// Pick the skills that match a subtask. Returns the matched names and the
/// merged skill prompt. More than one name is the resplit signal; zero names
/// (or any failure) falls back to the generic skill.
pub(crate) fn select_skills(
    engine: &AgentEngine,
    task: &Subtask,
    catalog: &DefCatalog,
) -> (Vec<String>, String) {
    if catalog.is_empty() {
        return (Vec::new(), GENERIC_SKILL_PROMPT.to_string());
    }
    let index = numbered_index(
        catalog
            .iter()
            .map(|d| (d.name.as_str(), d.description.as_str())),
    );
    let Some(raw) = classify(engine, SKILL_SELECTOR_SYSTEM, &task.description, &index) else {
        return (Vec::new(), GENERIC_SKILL_PROMPT.to_string());
    };
    let names: Vec<String> = parse_selection(&raw, catalog.len())
        .into_iter()
        .filter_map(|i| catalog.names().get(i).cloned())
        .collect();
    if names.is_empty() {
        return (Vec::new(), GENERIC_SKILL_PROMPT.to_string());
    }
    let merged = names
        .iter()
        .filter_map(|n| catalog.get(n))
        .map(|d| d.body.trim().to_string())
        .collect::<Vec<_>>()
        .join("\n\n");
    (names, merged)
}

/// Pick the rules that constrain a subtask. Returns rule bodies; any failure
/// means no rules.
pub(crate) fn select_rules(
    engine: &AgentEngine,
    task: &Subtask,
    catalog: &DefCatalog,
) -> Vec<String> {
    if catalog.is_empty() {
        return Vec::new();
    }
    let index = numbered_index(
        catalog
            .iter()
            .map(|d| (d.name.as_str(), d.description.as_str())),
    );
    let Some(raw) = classify(engine, RULE_SELECTOR_SYSTEM, &task.description, &index) else {
        return Vec::new();
    };
    parse_selection(&raw, catalog.len())
        .into_iter()
        .filter_map(|i| catalog.names().get(i).cloned())
        .filter_map(|name| catalog.get(&name).map(|d| d.body.clone()))
        .collect()
}

/// Pick the tools a subtask needs. Single pass while the pool is small; above
/// `two_pass_tool_threshold`, a category pass narrows the pool first so the
/// classification cost stays sublinear in total pool size. Any failure or an
/// empty pick falls back to all registered tools.
pub(crate) fn select_tools(engine: &AgentEngine, task: &Subtask) -> Vec<String> {
    let pool = engine.tools.names();
    let task_text = match &task.tool_hint {
        Some(hint) => format!("{}\nHint: {hint}", task.description),
        None => task.description.clone(),
    };

    let narrowed = if pool.len() > engine.cfg.agent.two_pass_tool_threshold {
        let categories: Vec<_> = engine.tools.categories().collect();
        let index = numbered_index(
            categories
                .iter()
                .map(|c| (c.name.as_str(), c.description.as_str())),
        );
        let chosen: Vec<String> = classify(engine, CATEGORY_SELECTOR_SYSTEM, &task_text, &index)
            .map(|raw| {
                parse_selection(&raw, categories.len())
                    .into_iter()
                    .map(|i| categories[i].name.clone())
                    .collect()
            })
            .unwrap_or_default();
        let narrowed = engine.tools.tools_in_categories(&chosen);
        if narrowed.is_empty() { pool.clone() } else { narrowed }
    } else {
        pool.clone()
    };

    let described = engine.tools.descriptions_for(&narrowed);
    let index = numbered_index(described.iter().map(|(n, d)| (n.as_str(), d.as_str())));
    let selected: Vec<String> = classify(engine, TOOL_SELECTOR_SYSTEM, &task_text, &index)
        .map(|raw| {
            parse_selection(&raw, narrowed.len())
                .into_iter()
                .filter_map(|i| narrowed.get(i).cloned())
                .collect()
        })
        .unwrap_or_default();

    if selected.is_empty() { pool } else { selected }
}

//! Read-only reasoning stage.
//!
//! The reasoner explores the workspace with inspection tools only and ends
//! by emitting exactly one structured edit action. It cannot write, so it
//! has no path to report a completed edit that never happened; the writer
//! applies its action mechanically afterwards.

use crate::assembler::ContextAssembler;
use crate::{AgentEngine, session};
use anyhow::Result;
use regex::Regex;
use serde_json::Value;
use shoestring_core::{EditAction, RunState, Subtask, ToolCall, truncate_chars};
use shoestring_tools::{CATEGORY_CODE_SEARCH, CATEGORY_FILE_READ};
use std::collections::BTreeMap;
use std::sync::OnceLock;

const SKILL_SECTION_CHARS: usize = 300;
const RULE_LINE_CHARS: usize = 100;
const FALLBACK_SUMMARY_CHARS: usize = 500;

fn reasoner_system(task: &Subtask) -> String {
    let mut system = String::from(
        "You are a careful analyst completing one focused task.\n\
         \n\
         You have access to READ tools only. Use them freely to gather all the\n\
         context you need: follow imports, read related files.\n\
         \n\
         When you have enough context, output an edit plan as a JSON block.\n\
         Do NOT attempt to write or edit files; that is handled separately.\n\
         \n\
         Output format when ready (choose one):\n\
         \n\
         For patching an existing file:\n\
         ```json\n\
         {\"action\": \"patch\", \"file\": \"relative/path\",\n\
          \"old\": \"exact string to replace (must be unique in the file)\",\n\
          \"new\": \"replacement string\"}\n\
         ```\n\
         \n\
         For several replacements in ONE file:\n\
         ```json\n\
         {\"action\": \"multi_patch\", \"file\": \"relative/path\",\n\
          \"patches\": [{\"old\": \"...\", \"new\": \"...\"}]}\n\
         ```\n\
         \n\
         For writing a whole new file:\n\
         ```json\n\
         {\"action\": \"write\", \"file\": \"relative/path\", \"content\": \"full file content\"}\n\
         ```\n\
         \n\
         For tasks that require no file changes (read-only, research, reporting):\n\
         ```json\n\
         {\"action\": \"none\", \"summary\": \"what you found or concluded\"}\n\
         ```\n\
         \n\
         Rules:\n\
         - For patches: old must be an exact verbatim substring of the current file.\n\
           Read the file first, copy the exact string, do not paraphrase.\n\
         - For new files: write real, complete content, no placeholders.\n\
         - Output exactly ONE JSON block. No prose before or after it.\n",
    );
    if !task.skill_prompt.is_empty() {
        system.push_str(&format!(
            "\nGuidance: {}\n",
            truncate_chars(&task.skill_prompt, SKILL_SECTION_CHARS)
        ));
    }
    if !task.selected_rules.is_empty() {
        let rules = task
            .selected_rules
            .iter()
            .map(|r| truncate_chars(r, RULE_LINE_CHARS).replace('\n', " "))
            .collect::<Vec<_>>()
            .join(" | ");
        system.push_str(&format!("\nConstraints: {rules}\n"));
    }
    system
}

/// Failure context injected into the second (and last) execution attempt.
pub(crate) struct RetryContext {
    pub failure: String,
    pub previous_action: String,
    pub file: Option<String>,
    pub file_content: Option<String>,
}

impl RetryContext {
    pub(crate) fn render(&self) -> String {
        let mut block = format!(
            "\n\nPREVIOUS ATTEMPT FAILED.\nVerifier said: {}\nPrevious action: {}",
            self.failure, self.previous_action
        );
        if let (Some(file), Some(content)) = (&self.file, &self.file_content) {
            block.push_str(&format!(
                "\nTrue current content of {file}:\n---\n{content}\n---\n\
                 Copy literal text exactly from the content above; do not \
                 reconstruct it from memory."
            ));
        }
        block
    }
}

/// Run the read-only session and return the extracted action plus every file
/// content picked up along the way (fed into the file index).
pub(crate) fn reason(
    engine: &AgentEngine,
    state: &RunState,
    task: &Subtask,
    retry: Option<&RetryContext>,
) -> Result<(EditAction, BTreeMap<String, String>)> {
    let read_pool = engine
        .tools
        .tools_in_categories(&[CATEGORY_FILE_READ.to_string(), CATEGORY_CODE_SEARCH.to_string()]);
    let mut read_tools: Vec<String> = task
        .selected_tool_names
        .iter()
        .filter(|name| read_pool.contains(name))
        .cloned()
        .collect();
    if read_tools.is_empty() {
        read_tools = read_pool;
    }

    let context = ContextAssembler::new(&engine.workspace, &engine.cfg.budgets).build(task, state);
    let mut prompt = format!("TASK: {}", task.description);
    if !context.is_empty() {
        prompt.push_str(&format!("\n\nContext:\n{context}"));
    }
    if let Some(retry) = retry {
        prompt.push_str(&retry.render());
    }

    let mut index_updates = BTreeMap::new();
    let text = session::run_capability_session(
        engine,
        reasoner_system(task),
        prompt,
        &read_tools,
        engine.cfg.budgets.executor_budget_tokens,
        engine.cfg.agent.max_read_rounds,
        |call: &ToolCall, result: &str| {
            cache_read(call, result, &mut index_updates);
        },
    )?;

    Ok((extract_edit_action(&text), index_updates))
}

pub(crate) fn cache_read(call: &ToolCall, result: &str, index: &mut BTreeMap<String, String>) {
    if call.name != "read_file" || shoestring_core::result_is_error(result) {
        return;
    }
    if let Some(path) = call.args.get("path").and_then(Value::as_str) {
        index.insert(path.to_string(), result.to_string());
    }
}

/// Pull the one edit action out of the reasoner's final text: fenced JSON
/// first, then a bare JSON object, then a read-only summary fallback.
pub(crate) fn extract_edit_action(text: &str) -> EditAction {
    static JSON_FENCE_RE: OnceLock<Regex> = OnceLock::new();
    static ANY_FENCE_RE: OnceLock<Regex> = OnceLock::new();
    static OBJECT_RE: OnceLock<Regex> = OnceLock::new();
    let json_fence =
        JSON_FENCE_RE.get_or_init(|| Regex::new(r"(?s)```json\s*(.*?)```").expect("valid regex"));
    let any_fence =
        ANY_FENCE_RE.get_or_init(|| Regex::new(r"(?s)```\s*(.*?)```").expect("valid regex"));
    let object = OBJECT_RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

    for re in [json_fence, any_fence] {
        if let Some(captures) = re.captures(text)
            && let Some(body) = captures.get(1)
            && let Ok(action) = serde_json::from_str::<EditAction>(body.as_str().trim())
        {
            return action;
        }
    }
    if let Some(m) = object.find(text)
        && let Ok(action) = serde_json::from_str::<EditAction>(m.as_str())
    {
        return action;
    }
    EditAction::None {
        summary: truncate_chars(text.trim(), FALLBACK_SUMMARY_CHARS).to_string(),
    }
}

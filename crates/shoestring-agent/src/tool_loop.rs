//! Direct tool-loop execution strategy.
//!
//! One session holds both read and write capabilities and works the task in
//! bounded call/response rounds. Every successful write-class call is
//! recorded as a verifiable action (file plus the literal old/new strings or
//! content), so the verifier can re-check the result independently even
//! though this strategy skips the reason/write separation.

use crate::reasoner::{RetryContext, cache_read};
use crate::{AgentEngine, session};
use anyhow::Result;
use serde_json::Value;
use shoestring_core::{
    EditAction, RunState, Subtask, ToolCall, WriteResult, result_is_ok, truncate_chars,
};
use std::collections::BTreeMap;

const LOOP_SUMMARY_CHARS: usize = 300;

fn tool_loop_system(task: &Subtask) -> String {
    let mut system = String::from(
        "You are a careful software engineer completing one focused task.\n\
         \n\
         Use the available tools to read and modify files. Make the smallest\n\
         change that satisfies the task. Tool results starting with ERROR mean\n\
         the call failed; read the message and adjust.\n\
         \n\
         When the task is complete, reply with ONE short sentence describing\n\
         what you did. Do not describe changes you did not make with tools.\n",
    );
    if !task.skill_prompt.is_empty() {
        system.push_str(&format!(
            "\nGuidance: {}\n",
            truncate_chars(&task.skill_prompt, 300)
        ));
    }
    if !task.selected_rules.is_empty() {
        let rules = task
            .selected_rules
            .iter()
            .map(|r| truncate_chars(r, 100).replace('\n', " "))
            .collect::<Vec<_>>()
            .join(" | ");
        system.push_str(&format!("\nConstraints: {rules}\n"));
    }
    system
}

/// Run the direct loop. Returns the verifiable actions (one per touched
/// file, last write wins), the overall outcome, and file-index updates.
pub(crate) fn execute(
    engine: &AgentEngine,
    state: &RunState,
    task: &Subtask,
    retry: Option<&RetryContext>,
) -> Result<(Vec<EditAction>, WriteResult, BTreeMap<String, String>)> {
    let mut tool_names = task.selected_tool_names.clone();
    if tool_names.is_empty() {
        tool_names = engine.tools.names();
    }

    let context = crate::assembler::ContextAssembler::new(&engine.workspace, &engine.cfg.budgets)
        .build(task, state);
    let mut prompt = format!("TASK: {}", task.description);
    if !context.is_empty() {
        prompt.push_str(&format!("\n\nContext:\n{context}"));
    }
    if let Some(retry) = retry {
        prompt.push_str(&retry.render());
    }

    let mut touched: BTreeMap<String, EditAction> = BTreeMap::new();
    let mut index_updates = BTreeMap::new();
    let registry = &engine.tools;

    let text = session::run_capability_session(
        engine,
        tool_loop_system(task),
        prompt,
        &tool_names,
        engine.cfg.budgets.executor_budget_tokens,
        engine.cfg.agent.max_tool_rounds,
        |call: &ToolCall, result: &str| {
            cache_read(call, result, &mut index_updates);
            if registry.is_write_class(&call.name) && result_is_ok(result) {
                record_write(call, &mut touched, &mut index_updates);
            }
        },
    )?;

    let summary = truncate_chars(text.trim(), LOOP_SUMMARY_CHARS).to_string();
    let actions: Vec<EditAction> = touched.into_values().collect();
    let write_result = if actions.is_empty() {
        WriteResult {
            success: true,
            message: if summary.is_empty() {
                "No file changes made.".to_string()
            } else {
                summary
            },
            file: None,
        }
    } else {
        let files: Vec<&str> = actions.iter().filter_map(|a| a.target_file()).collect();
        WriteResult {
            success: true,
            message: format!("OK: modified {}", files.join(", ")),
            file: files.last().map(|f| f.to_string()),
        }
    };

    Ok((actions, write_result, index_updates))
}

fn record_write(
    call: &ToolCall,
    touched: &mut BTreeMap<String, EditAction>,
    index_updates: &mut BTreeMap<String, String>,
) {
    let Some(path) = call.args.get("path").and_then(Value::as_str) else {
        return;
    };
    match call.name.as_str() {
        "patch_file" => {
            let old = call
                .args
                .get("old")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let new = call
                .args
                .get("new")
                .and_then(Value::as_str)
                .unwrap_or_default();
            touched.insert(
                path.to_string(),
                EditAction::Patch {
                    file: path.to_string(),
                    old: old.to_string(),
                    new: new.to_string(),
                },
            );
        }
        "write_file" => {
            let content = call
                .args
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            touched.insert(
                path.to_string(),
                EditAction::Write {
                    file: path.to_string(),
                    content: content.to_string(),
                },
            );
            index_updates.insert(path.to_string(), truncate_chars(content, 200).to_string());
        }
        // A deleted file has nothing left to re-read, so it is dropped from
        // the verifiable set rather than checked by containment.
        "delete_file" => {
            touched.remove(path);
            index_updates.remove(path);
        }
        _ => {}
    }
}

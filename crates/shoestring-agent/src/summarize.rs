//! Post-execution compression: one sentence per finished subtask, one final
//! answer per run. Both calls degrade to the raw material they would have
//! summarized, so a dead model never blocks run completion.

use crate::AgentEngine;
use shoestring_core::{EditAction, LlmRequest, RunState, Subtask};

const SUMMARIZER_SYSTEM: &str = "Summarize in ONE sentence what was accomplished. \
Be specific: file name, what changed, outcome. No filler.";

const FINALIZER_SYSTEM: &str = "Write a clear, concise response to the user's \
original request. Based only on the completed subtask summaries provided. \
Mention what was created, changed, or found. Be specific.";

/// The raw outcome text for a subtask: verifier verdict first, then a
/// read-only action's own summary.
fn task_outcome(task: &Subtask) -> String {
    if let Some(msg) = &task.verify_message
        && !msg.is_empty()
    {
        return msg.clone();
    }
    if let Some(EditAction::None { summary }) = &task.edit_plan
        && !summary.is_empty()
    {
        return summary.clone();
    }
    "completed".to_string()
}

/// One-sentence summary of a finished subtask, carried into every later
/// subtask's context as a dependency summary.
pub(crate) fn summarize_task(engine: &AgentEngine, task: &Subtask) -> String {
    let outcome = task_outcome(task);
    let response = engine.llm.complete(&LlmRequest {
        prompt: format!("Task: {}\nOutcome: {outcome}", task.description),
        system: Some(SUMMARIZER_SYSTEM.to_string()),
        max_tokens: engine.cfg.budgets.summarizer_budget_tokens,
    });
    match response {
        Ok(r) if !r.text.trim().is_empty() => r.text.trim().to_string(),
        Ok(_) => outcome,
        Err(e) => {
            engine
                .observer
                .warn_log(&format!("summarizer call failed: {e}"));
            outcome
        }
    }
}

/// The user-facing answer, composed from subtask summaries only. The model
/// never sees file contents here; everything it can claim was already
/// verified upstream.
pub(crate) fn finalize(engine: &AgentEngine, state: &RunState) -> String {
    let lines: Vec<String> = state
        .plan
        .tasks
        .iter()
        .map(|task| {
            format!(
                "- {}: {}",
                task.title,
                task.result_summary.as_deref().unwrap_or("completed")
            )
        })
        .collect();
    let completed = lines.join("\n");

    let response = engine.llm.complete(&LlmRequest {
        prompt: format!(
            "User request: {}\n\nCompleted:\n{completed}",
            state.user_request
        ),
        system: Some(FINALIZER_SYSTEM.to_string()),
        max_tokens: engine.cfg.budgets.planner_budget_tokens,
    });
    match response {
        Ok(r) if !r.text.trim().is_empty() => r.text.trim().to_string(),
        Ok(_) => completed,
        Err(e) => {
            engine
                .observer
                .warn_log(&format!("finalizer call failed: {e}"));
            completed
        }
    }
}

//! Planner and replanner: turn a request (or an over-broad subtask) into an
//! ordered list of small, dependency-annotated subtasks.

use crate::AgentEngine;
use anyhow::Result;
use ignore::WalkBuilder;
use regex::Regex;
use shoestring_core::{LlmRequest, Plan, RunState, Subtask, TaskStatus};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

const WORKSPACE_LISTING_CAP: usize = 40;

fn planner_system(max_subtasks: usize) -> String {
    format!(
        "You are a task planner for a general-purpose coding assistant.\n\
         \n\
         Break the user request into an ORDERED list of small, FOCUSED subtasks.\n\
         Each subtask must do ONE thing and touch AT MOST 1-2 files or resources.\n\
         \n\
         Rules:\n\
         - Max {max_subtasks} subtasks.\n\
         - Prefer small targeted actions over broad sweeping ones.\n\
         - depends_on lists IDs of tasks that must finish first.\n\
         \n\
         Respond with ONLY a valid JSON array, no markdown fences.\n\
         \n\
         [\n\
           {{\n\
             \"id\": 1,\n\
             \"title\": \"short label\",\n\
             \"description\": \"precise instruction\",\n\
             \"depends_on\": [],\n\
             \"context_hints\": [\"filename\"],\n\
             \"tool_hint\": \"read|write|run|search|patch\"\n\
           }}\n\
         ]"
    )
}

const REPLANNER_SYSTEM: &str = "Split this multi-skill task into smaller subtasks, \
one per skill.\n\
Respond with ONLY a valid JSON array, no markdown fences.\n\
[{\"id\":1,\"title\":\"...\",\"description\":\"...\",\"depends_on\":[],\
\"context_hints\":[],\"tool_hint\":\"read\"}]";

/// Produce the initial plan for a request. Model transport failure is the
/// only error path; an unparseable response falls back to a single catch-all
/// subtask carrying the raw text.
pub(crate) fn plan_request(engine: &AgentEngine, request: &str) -> Result<Plan> {
    let listing = list_workspace_files(&engine.workspace);
    let response = engine.llm.complete(&LlmRequest {
        prompt: format!("Plan this request:\n{request}\n\nWorkspace files:\n{listing}"),
        system: Some(planner_system(engine.cfg.agent.max_subtasks)),
        max_tokens: engine.cfg.budgets.planner_budget_tokens,
    })?;

    let mut tasks = parse_plan(&response.text, 0, engine.cfg.agent.max_subtasks);
    retain_known_deps(&mut tasks, &BTreeSet::new());
    for task in &tasks {
        engine.observer.stage_log(
            task.id,
            "planned",
            &format!("title={:?} deps={:?}", task.title, task.depends_on),
        );
    }
    Ok(Plan::new(tasks))
}

/// Split the subtask at the cursor into one subtask per matched skill,
/// splicing the replacements in at the cursor. On any failure the original
/// task is kept and proceeds as a single-skill task.
pub(crate) fn replan_current(engine: &AgentEngine, state: &mut RunState) -> Result<()> {
    let Some(task) = state.plan.current() else {
        return Ok(());
    };
    let parent_depth = task.replan_depth + 1;
    let skills_list = task
        .selected_skills
        .iter()
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!("Task: {}\nSkills:\n{skills_list}", task.description);

    let response = engine.llm.complete(&LlmRequest {
        prompt,
        system: Some(REPLANNER_SYSTEM.to_string()),
        max_tokens: engine.cfg.budgets.planner_budget_tokens,
    })?;

    let offset = state.plan.max_id();
    let mut new_tasks = parse_plan(&response.text, offset, engine.cfg.agent.max_subtasks);
    for t in &mut new_tasks {
        t.replan_depth = parent_depth;
    }

    // Spliced tasks may only depend on surviving plan tasks or each other;
    // anything else is dropped before the splice is validated.
    let surviving: BTreeSet<u64> = state
        .plan
        .tasks
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != state.plan.current_index)
        .map(|(_, t)| t.id)
        .collect();
    retain_known_deps(&mut new_tasks, &surviving);

    match state.plan.splice_at_cursor(new_tasks) {
        Ok(()) => {
            for t in &state.plan.tasks[state.plan.current_index..] {
                if t.replan_depth == parent_depth {
                    engine.observer.stage_log(t.id, "replanned", &format!("title={:?}", t.title));
                }
            }
            Ok(())
        }
        Err(e) => {
            engine.observer.warn_log(&format!("replan splice rejected: {e}"));
            if let Some(task) = state.plan.current_mut() {
                task.status = TaskStatus::Skills;
            }
            Ok(())
        }
    }
}

/// Parse a model-produced plan permissively. Ids and dependencies are
/// shifted by `id_offset` so replanner output cannot collide with existing
/// ids. Any parse failure yields a single catch-all subtask.
pub(crate) fn parse_plan(raw: &str, id_offset: u64, max_subtasks: usize) -> Vec<Subtask> {
    static FENCE_RE: OnceLock<Regex> = OnceLock::new();
    static ARRAY_RE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE_RE.get_or_init(|| Regex::new(r"```(?:json)?").expect("valid regex"));
    let array = ARRAY_RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").expect("valid regex"));

    let cleaned = fence.replace_all(raw, "");
    let cleaned = cleaned.trim();
    let Some(m) = array.find(cleaned) else {
        return vec![catch_all_task(cleaned, id_offset)];
    };
    let Ok(items) = serde_json::from_str::<Vec<serde_json::Value>>(m.as_str()) else {
        return vec![catch_all_task(cleaned, id_offset)];
    };

    let mut tasks: Vec<Subtask> = Vec::new();
    for item in items.iter().take(max_subtasks) {
        let fallback_id = tasks.len() as u64 + 1;
        let id = item.get("id").and_then(|v| v.as_u64()).unwrap_or(fallback_id) + id_offset;
        let title = item
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Task {fallback_id}"));
        let description = item
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut task = Subtask::new(id, title, description);
        task.depends_on = item
            .get("depends_on")
            .and_then(|v| v.as_array())
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| d.as_u64())
                    .map(|d| d + id_offset)
                    .collect()
            })
            .unwrap_or_default();
        task.context_hints = item
            .get("context_hints")
            .and_then(|v| v.as_array())
            .map(|hints| {
                hints
                    .iter()
                    .filter_map(|h| h.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        task.tool_hint = item
            .get("tool_hint")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        tasks.push(task);
    }

    if tasks.is_empty() {
        return vec![catch_all_task(cleaned, id_offset)];
    }
    tasks
}

fn catch_all_task(raw: &str, id_offset: u64) -> Subtask {
    let description = if raw.is_empty() {
        "Complete the user request"
    } else {
        raw
    };
    Subtask::new(1 + id_offset, "Execute request", description)
}

/// Drop `depends_on` ids that resolve neither to another task in the batch
/// nor to a task in `also_known`.
fn retain_known_deps(tasks: &mut [Subtask], also_known: &BTreeSet<u64>) {
    let batch_ids: BTreeSet<u64> = tasks.iter().map(|t| t.id).collect();
    for task in tasks.iter_mut() {
        task.depends_on
            .retain(|dep| batch_ids.contains(dep) || also_known.contains(dep));
    }
}

/// Compact workspace listing for the planner prompt. Hidden files are
/// skipped and the listing is capped, matching the small context budget.
pub(crate) fn list_workspace_files(workspace: &Path) -> String {
    if !workspace.exists() {
        return "(empty workspace)".to_string();
    }
    let mut lines: Vec<String> = WalkBuilder::new(workspace)
        .build()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .filter_map(|e| {
            e.path()
                .strip_prefix(workspace)
                .ok()
                .map(|rel| rel.display().to_string())
        })
        .collect();
    lines.sort();
    if lines.is_empty() {
        return "(empty workspace)".to_string();
    }
    if lines.len() > WORKSPACE_LISTING_CAP {
        lines.truncate(WORKSPACE_LISTING_CAP);
        lines.push("... (more files)".to_string());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_fenced_plan_array() {
        let raw = r#"```json
        [
          {"id": 1, "title": "Read config", "description": "read it",
           "depends_on": [], "context_hints": ["config.py"], "tool_hint": "read"},
          {"id": 2, "title": "Patch config", "description": "patch it",
           "depends_on": [1], "context_hints": [], "tool_hint": "patch"}
        ]
        ```"#;
        let tasks = parse_plan(raw, 0, 12);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].context_hints, vec!["config.py"]);
        assert_eq!(tasks[1].depends_on, vec![1]);
        assert_eq!(tasks[1].tool_hint.as_deref(), Some("patch"));
        assert_eq!(tasks[0].status, TaskStatus::Pending);
    }

    #[test]
    fn id_offset_shifts_ids_and_dependencies() {
        let raw = r#"[{"id":1,"title":"a","description":"","depends_on":[]},
                      {"id":2,"title":"b","description":"","depends_on":[1]}]"#;
        let tasks = parse_plan(raw, 5, 12);
        assert_eq!(tasks[0].id, 6);
        assert_eq!(tasks[1].id, 7);
        assert_eq!(tasks[1].depends_on, vec![6]);
    }

    #[test]
    fn unparseable_output_becomes_a_catch_all_task() {
        let tasks = parse_plan("I cannot produce JSON, sorry.", 0, 12);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, 1);
        assert_eq!(tasks[0].title, "Execute request");
        assert!(tasks[0].description.contains("cannot produce JSON"));
    }

    #[test]
    fn empty_output_gets_a_default_description() {
        let tasks = parse_plan("", 0, 12);
        assert_eq!(tasks[0].description, "Complete the user request");
    }

    #[test]
    fn plan_is_capped_at_max_subtasks() {
        let items: Vec<String> = (1..=20)
            .map(|i| format!(r#"{{"id":{i},"title":"t{i}","description":"d"}}"#))
            .collect();
        let raw = format!("[{}]", items.join(","));
        let tasks = parse_plan(&raw, 0, 12);
        assert_eq!(tasks.len(), 12);
    }

    #[test]
    fn unknown_dependencies_are_dropped() {
        let raw = r#"[{"id":1,"title":"a","description":"","depends_on":[7,1]}]"#;
        let mut tasks = parse_plan(raw, 0, 12);
        retain_known_deps(&mut tasks, &BTreeSet::new());
        assert_eq!(tasks[0].depends_on, vec![1]);
    }

    #[test]
    fn workspace_listing_skips_hidden_and_caps() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("main.py"), "x").expect("write");
        std::fs::create_dir_all(dir.path().join(".git")).expect("mkdir");
        std::fs::write(dir.path().join(".git/config"), "x").expect("write");
        let listing = list_workspace_files(dir.path());
        assert_eq!(listing, "main.py");

        let empty = tempfile::tempdir().expect("tempdir");
        assert_eq!(list_workspace_files(empty.path()), "(empty workspace)");
    }
}

//! The per-subtask stage loop.
//!
//! Each subtask moves through skill selection, rule selection, tool
//! selection, execution, verification and summarization before the cursor
//! advances. A multi-skill match at the skills stage diverts through the
//! replanner instead. An unready dependency halts the whole run at the
//! cursor; the finalizer then reports on whatever finished.

use crate::reasoner::RetryContext;
use crate::{AgentEngine, RunReport, planner, reasoner, selection, summarize, tool_loop, verifier, writer};
use anyhow::Result;
use serde_json::json;
use shoestring_core::{
    EditAction, ExecutionStrategy, RunState, Subtask, TaskStatus, ToolCall, WriteResult,
    is_valid_task_transition, result_is_error,
};
use shoestring_defs::{DefCatalog, load_catalog, rule_roots, skill_roots};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Drive `state` to completion (or to a dependency halt) and produce the
/// run report. Safe to call on a resumed state: finished subtasks are
/// skipped, the first unfinished one restarts from its skills stage.
pub(crate) fn run(engine: &AgentEngine, state: &mut RunState) -> Result<RunReport> {
    let skills = load_defs(
        engine,
        skill_roots(&engine.workspace, &engine.cfg.workspace.skill_paths),
        "skill",
    );
    let rules = load_defs(
        engine,
        rule_roots(&engine.workspace, &engine.cfg.workspace.rule_paths),
        "rule",
    );

    while !state.plan.is_complete() {
        let Some(snapshot) = state.plan.current().cloned() else {
            break;
        };
        if snapshot.status == TaskStatus::Done {
            state.plan.advance();
            continue;
        }
        if let Some(dep) = state.plan.first_unready_dep(&snapshot) {
            engine.observer.stage_log(
                snapshot.id,
                "halted",
                &format!("dependency {dep} is not done; finalizing early"),
            );
            break;
        }

        // Skills. More than one match means the task straddles domains and
        // should be split, unless the replan depth cap has been reached.
        let (skill_names, skill_prompt) = selection::select_skills(engine, &snapshot, &skills);
        let multi_skill = skill_names.len() > 1;
        let resplit = multi_skill && snapshot.replan_depth < engine.cfg.agent.max_replan_depth;
        if multi_skill && !resplit {
            engine.observer.stage_log(
                snapshot.id,
                "skills",
                &format!(
                    "matched {} skills at replan depth {}; proceeding unsplit",
                    skill_names.len(),
                    snapshot.replan_depth
                ),
            );
        }
        if let Some(task) = state.plan.current_mut() {
            task.selected_skills = skill_names;
            task.skill_prompt = skill_prompt;
        }
        if resplit {
            set_current_status(engine, state, TaskStatus::NeedsResplit);
            if let Err(e) = planner::replan_current(engine, state) {
                engine.observer.warn_log(&format!("replanning failed: {e}"));
                set_current_status(engine, state, TaskStatus::Skills);
            }
            // A successful splice put fresh subtasks at the cursor; restart
            // the stage loop on the first of them. A rejected splice left
            // the original task in place, so it falls through below.
            if state.plan.current().map(|t| t.id) != Some(snapshot.id) {
                continue;
            }
        } else {
            set_current_status(engine, state, TaskStatus::Skills);
        }

        // Rules and tools.
        let rule_bodies = selection::select_rules(engine, &snapshot, &rules);
        if let Some(task) = state.plan.current_mut() {
            task.selected_rules = rule_bodies;
        }
        set_current_status(engine, state, TaskStatus::Rules);

        let tool_names = selection::select_tools(engine, &snapshot);
        if let Some(task) = state.plan.current_mut() {
            task.selected_tool_names = tool_names;
        }
        set_current_status(engine, state, TaskStatus::Tools);

        set_current_status(engine, state, TaskStatus::Running);
        execute_and_verify(engine, state);
        set_current_status(engine, state, TaskStatus::Done);

        if let Some(task) = state.plan.current().cloned() {
            let summary = summarize::summarize_task(engine, &task);
            engine.observer.stage_log(task.id, "done", &summary);
            if let Some(task) = state.plan.current_mut() {
                task.result_summary = Some(summary);
            }
        }
        if let Err(e) = engine.store.save_checkpoint(engine.session_id, state) {
            engine.observer.warn_log(&format!("checkpoint failed: {e}"));
        }
        state.plan.advance();
    }

    let final_answer = summarize::finalize(engine, state);
    if let Err(e) = engine.store.save_checkpoint(engine.session_id, state) {
        engine.observer.warn_log(&format!("final checkpoint failed: {e}"));
    }
    Ok(engine.report_for(state, final_answer))
}

/// Run the configured execution strategy, verify the claimed edits, and
/// retry once with failure context if verification rejects them. Always
/// leaves verify_passed/verify_message set on the current subtask.
fn execute_and_verify(engine: &AgentEngine, state: &mut RunState) {
    let mut retry: Option<RetryContext> = None;
    loop {
        let Some(snapshot) = state.plan.current().cloned() else {
            return;
        };
        let (mut actions, write_result, index_updates) =
            run_strategy(engine, state, &snapshot, retry.as_ref());
        if actions.is_empty() && write_result.success {
            // A run that touched no files is still an outcome; carry its
            // text through verification as a read-only action.
            actions.push(EditAction::None {
                summary: write_result.message.clone(),
            });
        }
        state.merge_file_index(index_updates);

        let verification =
            verifier::verify_all(&engine.tools, &engine.cfg.budgets, &actions, &write_result);
        state.merge_file_index(verification.index_updates);

        if let Some(task) = state.plan.current_mut() {
            task.edit_plan = actions.last().cloned();
            task.write_result = Some(write_result);
            task.verify_passed = Some(verification.passed);
            task.verify_message = Some(verification.message.clone());
        }
        engine.observer.stage_log(
            snapshot.id,
            "verified",
            &format!("passed={} {}", verification.passed, verification.message),
        );

        if verification.passed || snapshot.retry_count >= engine.cfg.agent.max_retries {
            return;
        }
        if let Some(task) = state.plan.current_mut() {
            task.retry_count += 1;
        }
        retry = Some(build_retry(engine, &actions, &verification.message));
        engine
            .observer
            .stage_log(snapshot.id, "retry", &verification.message);
    }
}

fn run_strategy(
    engine: &AgentEngine,
    state: &RunState,
    task: &Subtask,
    retry: Option<&RetryContext>,
) -> (Vec<EditAction>, WriteResult, BTreeMap<String, String>) {
    let outcome = match engine.cfg.agent.strategy {
        ExecutionStrategy::ReasonThenWrite => {
            reasoner::reason(engine, state, task, retry).map(|(action, reads)| {
                let (write_result, write_updates) =
                    writer::apply_action(&engine.tools, &action, task.id);
                let mut updates = reads;
                updates.extend(write_updates);
                (vec![action], write_result, updates)
            })
        }
        ExecutionStrategy::ToolLoop => tool_loop::execute(engine, state, task, retry),
    };
    match outcome {
        Ok(result) => result,
        // Transport failure counts as a failed attempt, not a crashed run;
        // the normal retry/verify path picks it up.
        Err(e) => (
            Vec::new(),
            WriteResult::failure(format!("ERROR: model call failed: {e}")),
            BTreeMap::new(),
        ),
    }
}

/// Failure context for the second attempt: the verifier's verdict, the
/// action that failed, and the true current content of the target file.
fn build_retry(engine: &AgentEngine, actions: &[EditAction], failure: &str) -> RetryContext {
    let last = actions.last();
    let previous_action = last
        .and_then(|a| serde_json::to_string(a).ok())
        .unwrap_or_else(|| "(no action)".to_string());
    let file = last
        .and_then(|a| a.target_file())
        .map(|f| f.to_string());
    let file_content = file.as_ref().and_then(|f| {
        let content = engine.tools.invoke(&ToolCall {
            name: "read_file".to_string(),
            args: json!({"path": f}),
        });
        (!result_is_error(&content)).then_some(content)
    });
    RetryContext {
        failure: failure.to_string(),
        previous_action,
        file,
        file_content,
    }
}

fn set_current_status(engine: &AgentEngine, state: &mut RunState, to: TaskStatus) {
    let Some(task) = state.plan.current_mut() else {
        return;
    };
    if !is_valid_task_transition(task.status, to) {
        engine.observer.warn_log(&format!(
            "subtask {}: unexpected transition {} -> {}",
            task.id,
            task.status.label(),
            to.label()
        ));
    }
    task.status = to;
}

fn load_defs(engine: &AgentEngine, roots: Vec<PathBuf>, kind: &str) -> DefCatalog {
    match load_catalog(&roots) {
        Ok(catalog) => catalog,
        Err(e) => {
            engine
                .observer
                .warn_log(&format!("failed to load {kind} definitions: {e}"));
            DefCatalog::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedLlm, engine_in, engine_with, text_response, tool_call_response};
    use serde_json::json;

    fn run_with(engine: &AgentEngine, request: &str) -> (RunState, RunReport) {
        let mut state = RunState::new(request);
        state.plan = planner::plan_request(engine, request).expect("plan");
        let report = run(engine, &mut state).expect("run");
        (state, report)
    }

    fn one_task_plan() -> shoestring_core::LlmResponse {
        text_response(
            r#"[{"id":1,"title":"Update a.py","description":"Change x=1 to x=2 in a.py",
                "depends_on":[],"context_hints":["a.py"],"tool_hint":"patch"}]"#,
        )
    }

    #[test]
    fn patch_task_runs_to_a_verified_done() {
        let (dir, engine) = engine_with(
            ScriptedLlm::new(vec![
                one_task_plan(),
                text_response("none"), // tool selector: fall back to all tools
                text_response(
                    "```json\n{\"action\": \"patch\", \"file\": \"a.py\", \"old\": \"x=1\", \"new\": \"x=2\"}\n```",
                ),
                text_response("Changed x=1 to x=2 in a.py."),
                text_response("Updated a.py as requested."),
            ]),
            |_| {},
        );
        std::fs::write(dir.path().join("a.py"), "x=1\n").expect("write");

        let (state, report) = run_with(&engine, "change x to 2 in a.py");

        let task = &state.plan.tasks[0];
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.verify_passed, Some(true));
        assert_eq!(task.retry_count, 0);
        assert_eq!(report.final_answer, "Updated a.py as requested.");
        let content = std::fs::read_to_string(dir.path().join("a.py")).expect("read");
        assert_eq!(content, "x=2\n");
    }

    #[test]
    fn ambiguous_patch_retries_once_then_fails_closed() {
        let patch_attempt = || {
            text_response(
                "```json\n{\"action\": \"patch\", \"file\": \"a.py\", \"old\": \"x=1\", \"new\": \"x=2\"}\n```",
            )
        };
        let (dir, engine) = engine_with(
            ScriptedLlm::new(vec![
                one_task_plan(),
                text_response("none"),
                patch_attempt(),
                patch_attempt(), // second attempt, same ambiguous target
                text_response("Could not apply the change to a.py."),
                text_response("The patch did not apply; a.py has two matching lines."),
            ]),
            |_| {},
        );
        std::fs::write(dir.path().join("a.py"), "x=1\nx=1\n").expect("write");

        let (state, report) = run_with(&engine, "change x to 2 in a.py");

        let task = &state.plan.tasks[0];
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.verify_passed, Some(false));
        assert_eq!(task.retry_count, 1);
        assert_eq!(report.tasks[0].verify_passed, Some(false));
        // Failed verification never mutates the workspace.
        let content = std::fs::read_to_string(dir.path().join("a.py")).expect("read");
        assert_eq!(content, "x=1\nx=1\n");
    }

    #[test]
    fn multi_skill_match_splits_the_task_and_runs_both_halves() {
        let (dir, engine) = engine_with(
            ScriptedLlm::new(vec![
                one_task_plan(),
                text_response("1, 2"), // both skills match: resplit
                text_response(
                    r#"[{"id":1,"title":"Code half","description":"handle the code",
                        "depends_on":[],"context_hints":[],"tool_hint":"read"},
                        {"id":2,"title":"Docs half","description":"handle the docs",
                        "depends_on":[1],"context_hints":[],"tool_hint":"read"}]"#,
                ),
                // First spliced task.
                text_response("1"),
                text_response("none"),
                text_response(r#"{"action": "none", "summary": "code half inspected"}"#),
                text_response("Inspected the code half."),
                // Second spliced task.
                text_response("2"),
                text_response("none"),
                text_response(r#"{"action": "none", "summary": "docs half inspected"}"#),
                text_response("Inspected the docs half."),
                text_response("Both halves are done."),
            ]),
            |_| {},
        );
        let skills_dir = dir.path().join(".shoestring/skills");
        std::fs::create_dir_all(&skills_dir).expect("mkdir");
        std::fs::write(skills_dir.join("coding.md"), "# Coding\nWrite minimal diffs.")
            .expect("write");
        std::fs::write(skills_dir.join("docs.md"), "# Docs\nKeep prose short.").expect("write");

        let (state, report) = run_with(&engine, "update the code and the docs");

        assert_eq!(state.plan.tasks.len(), 2);
        for task in &state.plan.tasks {
            assert_eq!(task.replan_depth, 1);
            assert_eq!(task.status, TaskStatus::Done);
            assert_eq!(task.verify_passed, Some(true));
        }
        assert_eq!(report.final_answer, "Both halves are done.");
    }

    #[test]
    fn an_unready_dependency_halts_the_run_and_finalizes_early() {
        let (_dir, engine) = engine_with(
            ScriptedLlm::new(vec![
                text_response(
                    r#"[{"id":1,"title":"First","description":"do the first thing",
                        "depends_on":[],"context_hints":[],"tool_hint":"read"},
                        {"id":2,"title":"Second","description":"do the second thing",
                        "depends_on":[3],"context_hints":[],"tool_hint":"read"},
                        {"id":3,"title":"Third","description":"do the third thing",
                        "depends_on":[],"context_hints":[],"tool_hint":"read"}]"#,
                ),
                text_response("none"),
                text_response(r#"{"action": "none", "summary": "first thing done"}"#),
                text_response("Did the first thing."),
                text_response("Stopped after the first step."),
            ]),
            |_| {},
        );

        let (state, report) = run_with(&engine, "three ordered things");

        assert_eq!(state.plan.tasks[0].status, TaskStatus::Done);
        assert_eq!(state.plan.tasks[1].status, TaskStatus::Pending);
        assert_eq!(state.plan.tasks[2].status, TaskStatus::Pending);
        assert_eq!(report.tasks.len(), 3);
        assert_eq!(report.tasks[1].summary, "not run");
        assert_eq!(report.final_answer, "Stopped after the first step.");
    }

    #[test]
    fn tool_loop_strategy_writes_and_verifies_through_the_same_path() {
        let (dir, engine) = engine_with(
            ScriptedLlm::new(vec![
                text_response(
                    r#"[{"id":1,"title":"Create hello.py","description":"write hello.py",
                        "depends_on":[],"context_hints":[],"tool_hint":"write"}]"#,
                ),
                text_response("none"),
                tool_call_response(&[(
                    "c1",
                    "write_file",
                    json!({"path": "hello.py", "content": "print('hi')\n"}),
                )]),
                text_response("Created hello.py."),
                text_response("Wrote hello.py with a greeting."),
                text_response("Created hello.py for you."),
            ]),
            |cfg| cfg.agent.strategy = ExecutionStrategy::ToolLoop,
        );

        let (state, report) = run_with(&engine, "make hello.py");

        let task = &state.plan.tasks[0];
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.verify_passed, Some(true));
        assert_eq!(
            task.edit_plan.as_ref().map(|a| a.kind()),
            Some("write")
        );
        assert_eq!(report.final_answer, "Created hello.py for you.");
        let content = std::fs::read_to_string(dir.path().join("hello.py")).expect("read");
        assert_eq!(content, "print('hi')\n");
    }

    #[test]
    fn resume_skips_finished_subtasks_and_runs_the_rest() {
        // First engine only writes the checkpoint: task 1 already Done,
        // task 2 untouched.
        let (dir, seed) = engine_with(ScriptedLlm::new(vec![]), |_| {});
        let mut state = RunState::new("two ordered things");
        let mut t1 = Subtask::new(1, "First", "do the first thing");
        t1.status = TaskStatus::Done;
        t1.verify_passed = Some(true);
        t1.result_summary = Some("first thing already done".to_string());
        let t2 = Subtask::new(2, "Second", "do the second thing");
        state.plan = shoestring_core::Plan::new(vec![t1, t2]);
        seed.store
            .save_checkpoint(seed.session_id(), &state)
            .expect("checkpoint");
        drop(seed);

        // The queue holds task 2's responses only; re-running task 1 would
        // consume them early and fail its verification.
        let mut engine = engine_in(
            dir.path(),
            ScriptedLlm::new(vec![
                text_response("none"),
                text_response(r#"{"action": "none", "summary": "second thing done"}"#),
                text_response("Did the second thing."),
                text_response("Both things are done."),
            ]),
            |_| {},
        );
        let report = engine
            .resume_latest()
            .expect("resume")
            .expect("checkpoint found");

        assert_eq!(report.tasks.len(), 2);
        assert_eq!(report.tasks[0].summary, "first thing already done");
        assert_eq!(report.tasks[1].verify_passed, Some(true));
        assert_eq!(report.tasks[1].summary, "Did the second thing.");
        assert_eq!(report.final_answer, "Both things are done.");
    }

    #[test]
    fn a_dead_model_fails_the_task_but_not_the_run() {
        // Queue runs dry right after planning and tool selection: both
        // execution attempts and both summarizing calls fall back.
        let (dir, engine) = engine_with(
            ScriptedLlm::new(vec![one_task_plan(), text_response("none")]),
            |_| {},
        );
        std::fs::write(dir.path().join("a.py"), "x=1\n").expect("write");

        let (state, report) = run_with(&engine, "change x to 2 in a.py");

        let task = &state.plan.tasks[0];
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.verify_passed, Some(false));
        assert_eq!(task.retry_count, 1);
        assert!(
            task.verify_message
                .as_deref()
                .is_some_and(|m| m.contains("model call failed"))
        );
        // Finalizer fell back to the bullet list of outcomes.
        assert!(report.final_answer.contains("Update a.py"));
    }
}

//! The staged pipeline that drives a small-context model through a plan of
//! bounded code-editing subtasks.
//!
//! Per-subtask flow: skill selection → (replanner on a multi-skill match) →
//! rule selection → tool selection → execution → verification → at most one
//! retry → summarizer. A planner opens the run and a finalizer closes it.
//! Everything is synchronous and strictly sequential; the only state is the
//! [`RunState`] threaded through every stage.

pub mod assembler;
pub mod pipeline;
pub mod planner;
pub mod reasoner;
pub mod selection;
mod session;
pub mod summarize;
pub mod tool_loop;
pub mod verifier;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use shoestring_core::{AppConfig, RunState, TaskStatus};
use shoestring_llm::LlmClient;
use shoestring_observe::Observer;
use shoestring_store::{Store, new_session_id};
use shoestring_tools::{CapabilityRegistry, default_registry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One row of the per-subtask status report.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: u64,
    pub title: String,
    pub status: &'static str,
    pub verify_passed: Option<bool>,
    pub summary: String,
}

/// Outcome of a whole run: the user-facing answer plus one report row per
/// subtask, in plan order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub final_answer: String,
    pub tasks: Vec<TaskReport>,
}

pub struct AgentEngine {
    pub(crate) workspace: PathBuf,
    pub(crate) cfg: AppConfig,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) tools: CapabilityRegistry,
    pub(crate) observer: Observer,
    pub(crate) store: Store,
    pub(crate) session_id: Uuid,
}

impl AgentEngine {
    pub fn new(workspace: &Path, cfg: AppConfig, llm: Arc<dyn LlmClient>) -> Result<Self> {
        let tools = default_registry(
            workspace,
            Duration::from_secs(cfg.workspace.command_timeout_secs),
        );
        let mut observer = Observer::new(workspace)?;
        observer.set_verbose(cfg.verbose);
        let store = Store::new(workspace)?;
        Ok(Self {
            workspace: workspace.to_path_buf(),
            cfg,
            llm,
            tools,
            observer,
            store,
            session_id: new_session_id(),
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.tools
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.observer.set_verbose(verbose);
    }

    /// Plan and run one natural-language request to completion.
    pub fn run_request(&mut self, request: &str) -> Result<RunReport> {
        self.session_id = new_session_id();
        let mut state = RunState::new(request);
        state.plan = planner::plan_request(self, request)?;
        pipeline::run(self, &mut state)
    }

    /// Continue the most recently checkpointed run, if one exists.
    /// Already-done subtasks are skipped; the pipeline picks up at the first
    /// unfinished one.
    pub fn resume_latest(&mut self) -> Result<Option<RunReport>> {
        let Some((session_id, mut state)) = self.store.latest_checkpoint()? else {
            return Ok(None);
        };
        self.session_id = session_id;
        Ok(Some(pipeline::run(self, &mut state)?))
    }

    pub(crate) fn report_for(&self, state: &RunState, final_answer: String) -> RunReport {
        let tasks = state
            .plan
            .tasks
            .iter()
            .map(|task| TaskReport {
                id: task.id,
                title: task.title.clone(),
                status: task.status.label(),
                verify_passed: task.verify_passed,
                summary: task
                    .result_summary
                    .clone()
                    .or_else(|| task.verify_message.clone())
                    .unwrap_or_else(|| {
                        if task.status == TaskStatus::Done {
                            "completed".to_string()
                        } else {
                            "not run".to_string()
                        }
                    }),
            })
            .collect();
        RunReport {
            final_answer,
            tasks,
        }
    }
}

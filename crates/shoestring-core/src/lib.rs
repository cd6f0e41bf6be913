use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".shoestring")
}

/// Textual success/failure convention for capability results.
///
/// Capabilities return a single text string. Results beginning with `OK`
/// indicate success, results beginning with `ERROR` indicate failure, and
/// anything else (e.g. raw file content from a read) is data. Callers must
/// match on the prefix, never on structured status.
pub const OK_PREFIX: &str = "OK";
pub const ERROR_PREFIX: &str = "ERROR";

pub fn result_is_ok(text: &str) -> bool {
    text.starts_with(OK_PREFIX)
}

pub fn result_is_error(text: &str) -> bool {
    text.starts_with(ERROR_PREFIX)
}

// ── Subtask state machine ─────────────────────────────────────────────────────

/// Pipeline position of a subtask.
///
/// `Done` is the only terminal state: both success and exhausted-retry failure
/// end here, with failure visible in `verify_message` rather than a separate
/// status. `NeedsResplit` is transient; it routes the subtask to the
/// replanner instead of rule selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    NeedsResplit,
    Skills,
    Rules,
    Tools,
    Running,
    Done,
}

pub fn is_valid_task_transition(from: TaskStatus, to: TaskStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        TaskStatus::Pending => matches!(to, TaskStatus::Skills | TaskStatus::NeedsResplit),
        // A resplit either spawns replacement tasks (this task is abandoned
        // in place) or, at the depth cap, proceeds as a single-skill task.
        TaskStatus::NeedsResplit => matches!(to, TaskStatus::Skills | TaskStatus::Done),
        TaskStatus::Skills => matches!(to, TaskStatus::Rules),
        TaskStatus::Rules => matches!(to, TaskStatus::Tools),
        TaskStatus::Tools => matches!(to, TaskStatus::Running),
        TaskStatus::Running => matches!(to, TaskStatus::Done),
        TaskStatus::Done => false,
    }
}

impl TaskStatus {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::NeedsResplit => "needs-resplit",
            TaskStatus::Skills => "skills",
            TaskStatus::Rules => "rules",
            TaskStatus::Tools => "tools",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
        }
    }
}

// ── Edit actions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHunk {
    pub old: String,
    pub new: String,
}

/// Structured edit plan emitted by the reasoning stage.
///
/// Parsed permissively at the model boundary, then matched exhaustively
/// downstream; no string-keyed dispatch past this point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EditAction {
    Patch {
        file: String,
        old: String,
        new: String,
    },
    /// Ordered replacements in one file, applied atomically: the first
    /// failing hunk aborts the rest.
    MultiPatch {
        file: String,
        patches: Vec<PatchHunk>,
    },
    Write {
        file: String,
        content: String,
    },
    None {
        #[serde(default)]
        summary: String,
    },
}

impl EditAction {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            EditAction::Patch { .. } => "patch",
            EditAction::MultiPatch { .. } => "multi_patch",
            EditAction::Write { .. } => "write",
            EditAction::None { .. } => "none",
        }
    }

    /// The file this action targets, if any.
    #[must_use]
    pub fn target_file(&self) -> Option<&str> {
        match self {
            EditAction::Patch { file, .. }
            | EditAction::MultiPatch { file, .. }
            | EditAction::Write { file, .. } => Some(file),
            EditAction::None { .. } => None,
        }
    }
}

/// Outcome of mechanically applying an [`EditAction`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResult {
    pub success: bool,
    pub message: String,
    pub file: Option<String>,
}

impl WriteResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            file: None,
        }
    }
}

// ── Subtasks and the plan ─────────────────────────────────────────────────────

/// One unit of work in the plan, covering at most one file/resource.
///
/// Created once by the planner (or replanner) and never deleted; mutated in
/// place by each pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: u64,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<u64>,
    #[serde(default)]
    pub context_hints: Vec<String>,
    /// Soft signal from the planner: primary capability expected
    /// (read/write/run/search/patch).
    #[serde(default)]
    pub tool_hint: Option<String>,

    #[serde(default)]
    pub selected_skills: Vec<String>,
    #[serde(default)]
    pub skill_prompt: String,
    /// Selected rule bodies, injected verbatim (truncated) as constraints.
    #[serde(default)]
    pub selected_rules: Vec<String>,
    #[serde(default)]
    pub selected_tool_names: Vec<String>,

    #[serde(default)]
    pub edit_plan: Option<EditAction>,
    #[serde(default)]
    pub write_result: Option<WriteResult>,
    #[serde(default)]
    pub verify_passed: Option<bool>,
    #[serde(default)]
    pub verify_message: Option<String>,

    #[serde(default)]
    pub retry_count: u8,
    #[serde(default)]
    pub replan_depth: u8,
    pub status: TaskStatus,
    /// One-line outcome, set once by the summarizer and immutable after.
    #[serde(default)]
    pub result_summary: Option<String>,
}

impl Subtask {
    pub fn new(id: u64, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: description.into(),
            depends_on: Vec::new(),
            context_hints: Vec::new(),
            tool_hint: None,
            selected_skills: Vec::new(),
            skill_prompt: String::new(),
            selected_rules: Vec::new(),
            selected_tool_names: Vec::new(),
            edit_plan: None,
            write_result: None,
            verify_passed: None,
            verify_message: None,
            retry_count: 0,
            replan_depth: 0,
            status: TaskStatus::Pending,
            result_summary: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("subtask {task} depends on unknown subtask {dep}")]
    UnknownDependency { task: u64, dep: u64 },
    #[error("replanner produced no subtasks")]
    EmptySplice,
}

/// Ordered subtask list plus the execution cursor.
///
/// The cursor only moves forward, except that a replanning splice resets it
/// to the first spliced-in subtask (those are then consumed forward again).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<Subtask>,
    pub current_index: usize,
}

impl Plan {
    pub fn new(tasks: Vec<Subtask>) -> Self {
        Self {
            tasks,
            current_index: 0,
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<&Subtask> {
        self.tasks.get(self.current_index)
    }

    pub fn current_mut(&mut self) -> Option<&mut Subtask> {
        self.tasks.get_mut(self.current_index)
    }

    #[must_use]
    pub fn find(&self, id: u64) -> Option<&Subtask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.current_index >= self.tasks.len()
    }

    #[must_use]
    pub fn max_id(&self) -> u64 {
        self.tasks.iter().map(|t| t.id).max().unwrap_or(0)
    }

    /// First dependency of `task` that has not reached `Done`, if any.
    ///
    /// Forward and sibling references are allowed (replanning inserts
    /// siblings before the cursor passes them), so this checks status, not
    /// position.
    #[must_use]
    pub fn first_unready_dep(&self, task: &Subtask) -> Option<u64> {
        task.depends_on
            .iter()
            .copied()
            .find(|dep_id| match self.find(*dep_id) {
                Some(dep) => dep.status != TaskStatus::Done,
                // Unknown ids are treated as unready: halting early beats
                // running a task whose inputs never existed.
                None => true,
            })
    }

    /// Every `depends_on` id must resolve to a subtask in the plan.
    pub fn validate_dependencies(&self) -> std::result::Result<(), PlanError> {
        for task in &self.tasks {
            for dep in &task.depends_on {
                if self.find(*dep).is_none() {
                    return Err(PlanError::UnknownDependency {
                        task: task.id,
                        dep: *dep,
                    });
                }
            }
        }
        Ok(())
    }

    /// Replace the subtask at the cursor with `replacements`, leaving the
    /// cursor pointing at the first new subtask. Untouched tasks keep their
    /// order and ids.
    pub fn splice_at_cursor(
        &mut self,
        replacements: Vec<Subtask>,
    ) -> std::result::Result<(), PlanError> {
        if replacements.is_empty() {
            return Err(PlanError::EmptySplice);
        }
        let idx = self.current_index;
        self.tasks.splice(idx..idx + 1, replacements);
        self.validate_dependencies()
    }

    pub fn advance(&mut self) {
        self.current_index += 1;
    }
}

// ── Run state ─────────────────────────────────────────────────────────────────

/// Canonical mutable state for one request, threaded explicitly through every
/// pipeline stage. Stages return partial updates; the controller merges them
/// here. No ambient globals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    pub user_request: String,
    pub plan: Plan,
    /// Filename → last-known content/snippet. Union-overwrite merge only.
    #[serde(default)]
    pub file_index: BTreeMap<String, String>,
}

impl RunState {
    pub fn new(user_request: impl Into<String>) -> Self {
        Self {
            user_request: user_request.into(),
            plan: Plan::default(),
            file_index: BTreeMap::new(),
        }
    }

    pub fn merge_file_index(&mut self, updates: BTreeMap<String, String>) {
        self.file_index.extend(updates);
    }
}

// ── Capability call types ─────────────────────────────────────────────────────

/// A single capability invocation: name plus named JSON arguments.
/// The result is always a single text string (see [`OK_PREFIX`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
}

// ── LLM wire types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments string as returned by the model.
    pub arguments: String,
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,
    #[serde(default)]
    pub tool_calls: Vec<LlmToolCall>,
}

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<LlmToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
    },
}

/// A tool (function) definition sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request for the chat-with-tools API.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Any OpenAI-compatible endpoint (Ollama, LM Studio, vLLM, LocalAI).
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            api_key: None,
            api_key_env: "SHOESTRING_API_KEY".to_string(),
            temperature: 0.1,
            max_output_tokens: 512,
            timeout_seconds: 60,
            max_retries: 2,
            retry_base_ms: 400,
        }
    }
}

/// Character/token ceilings for every model input. Driven by the backing
/// model's small context window; exact tokenization is unknown here, so the
/// chars-per-token ratio is a conservative fixed estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_context_tokens: u32,
    pub chars_per_token: f32,
    pub planner_budget_tokens: u32,
    pub executor_budget_tokens: u32,
    pub summarizer_budget_tokens: u32,
    pub selector_max_tokens: u32,
    /// Per-dependency-summary character cap inside assembled context.
    pub summary_max_chars: usize,
    /// Per-file-snippet character cap inside assembled context.
    pub file_snippet_max_chars: usize,
    /// Stop adding snippets once the remaining budget drops below this.
    pub min_snippet_budget_chars: usize,
    /// Prefix length checked when verifying a full-file write.
    pub write_verify_prefix_chars: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 2048,
            chars_per_token: 3.5,
            planner_budget_tokens: 800,
            executor_budget_tokens: 1200,
            summarizer_budget_tokens: 400,
            selector_max_tokens: 128,
            summary_max_chars: 300,
            file_snippet_max_chars: 600,
            min_snippet_budget_chars: 150,
            write_verify_prefix_chars: 80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStrategy {
    /// Read-only reasoning emits a structured edit plan; a deterministic
    /// writer applies it. The reasoning stage has no path to report success
    /// without an actual file mutation happening in the writer.
    ReasonThenWrite,
    /// Single stage with read+write capabilities and bounded rounds.
    ToolLoop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub strategy: ExecutionStrategy,
    pub max_subtasks: usize,
    pub max_replan_depth: u8,
    pub max_retries: u8,
    pub max_read_rounds: usize,
    pub max_tool_rounds: usize,
    /// Above this pool size the tool selector goes two-pass
    /// (categories first) to keep classification cost sublinear.
    pub two_pass_tool_threshold: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::ReasonThenWrite,
            max_subtasks: 12,
            max_replan_depth: 2,
            max_retries: 1,
            max_read_rounds: 10,
            max_tool_rounds: 12,
            two_pass_tool_threshold: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub command_timeout_secs: u64,
    /// Extra skill/rule directories, workspace-relative or absolute.
    pub skill_paths: Vec<String>,
    pub rule_paths: Vec<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30,
            skill_paths: Vec::new(),
            rule_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub budgets: BudgetConfig,
    pub agent: AgentConfig,
    pub workspace: WorkspaceConfig,
    pub verbose: bool,
}

impl AppConfig {
    pub fn config_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Load from `.shoestring/config.toml`, falling back to defaults for any
    /// missing section or key. A missing file is not an error.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = Self::config_path(workspace);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&raw)?;
        Ok(cfg)
    }

    /// Executor context budget in characters.
    #[must_use]
    pub fn executor_budget_chars(&self) -> usize {
        (self.budgets.executor_budget_tokens as f32 * self.budgets.chars_per_token) as usize
    }
}

/// Prefix-truncate on a character boundary. Truncation in this codebase
/// always keeps a prefix, never a suffix.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

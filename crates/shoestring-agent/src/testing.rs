//! Shared test fixtures: a scripted LLM and an engine on a temp workspace.

use crate::AgentEngine;
use anyhow::{Result, anyhow};
use shoestring_core::{AppConfig, ChatRequest, LlmRequest, LlmResponse, LlmToolCall};
use shoestring_llm::LlmClient;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Serves canned responses in call order, to `complete` and `complete_chat`
/// alike. An exhausted queue returns an error, which doubles as the "model
/// call failed" fixture.
pub(crate) struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
}

impl ScriptedLlm {
    pub(crate) fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
        }
    }

    fn next(&self) -> Result<LlmResponse> {
        self.responses
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or_else(|| anyhow!("no more scripted responses"))
    }
}

impl LlmClient for ScriptedLlm {
    fn complete(&self, _req: &LlmRequest) -> Result<LlmResponse> {
        self.next()
    }

    fn complete_chat(&self, _req: &ChatRequest) -> Result<LlmResponse> {
        self.next()
    }
}

pub(crate) fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        text: text.to_string(),
        finish_reason: "stop".to_string(),
        tool_calls: Vec::new(),
    }
}

pub(crate) fn tool_call_response(calls: &[(&str, &str, serde_json::Value)]) -> LlmResponse {
    LlmResponse {
        text: String::new(),
        finish_reason: "tool_calls".to_string(),
        tool_calls: calls
            .iter()
            .map(|(id, name, args)| LlmToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.to_string(),
            })
            .collect(),
    }
}

/// Engine over a fresh temp workspace, with a config hook for per-test
/// tweaks. The tempdir guard must be held for the engine's lifetime.
pub(crate) fn engine_with(
    llm: ScriptedLlm,
    tweak: impl FnOnce(&mut AppConfig),
) -> (tempfile::TempDir, AgentEngine) {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path(), llm, tweak);
    (dir, engine)
}

/// Engine over an existing workspace, for tests that span several engine
/// lifetimes (checkpoint and resume).
pub(crate) fn engine_in(
    workspace: &std::path::Path,
    llm: ScriptedLlm,
    tweak: impl FnOnce(&mut AppConfig),
) -> AgentEngine {
    let mut cfg = AppConfig::default();
    tweak(&mut cfg);
    AgentEngine::new(workspace, cfg, Arc::new(llm)).expect("engine")
}

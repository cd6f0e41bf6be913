use anyhow::{Result, anyhow};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use shoestring_core::{ChatRequest, LlmConfig, LlmRequest, LlmResponse, LlmToolCall};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Base delay for network/transport error retries (1s, 2s, 4s backoff).
const NETWORK_RETRY_BASE_MS: u64 = 1000;

pub trait LlmClient: Send + Sync {
    /// Single-turn completion: optional system prompt plus one user message.
    fn complete(&self, req: &LlmRequest) -> Result<LlmResponse>;

    /// Multi-turn chat completion with tool definitions (function calling).
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse>;
}

/// Blocking client for any OpenAI-compatible endpoint (Ollama, LM Studio,
/// vLLM, LocalAI, the common self-hosted options for closed networks).
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    cfg: LlmConfig,
    client: Client,
}

impl OpenAiCompatClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        )
    }

    fn api_key(&self) -> String {
        self.cfg
            .api_key
            .clone()
            .or_else(|| std::env::var(&self.cfg.api_key_env).ok())
            .unwrap_or_else(|| "none".to_string())
    }

    fn post_with_retries(&self, payload: &Value) -> Result<LlmResponse> {
        let api_key = self.api_key();
        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(self.endpoint())
                .bearer_auth(&api_key)
                .json(payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text()?;
                    if status.is_success() {
                        return parse_chat_payload(&body);
                    }
                    last_err = Some(anyhow!(
                        "llm endpoint returned {status}: {}",
                        shoestring_core::truncate_chars(&body, 400)
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(self.cfg.retry_base_ms, attempt));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(anyhow!("llm transport error: {e}"));
                    if (e.is_timeout() || e.is_connect() || e.is_request())
                        && attempt < self.cfg.max_retries
                    {
                        thread::sleep(retry_delay(NETWORK_RETRY_BASE_MS, attempt));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("llm request failed without detailed error")))
    }
}

impl LlmClient for OpenAiCompatClient {
    fn complete(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": req.prompt}));
        let payload = json!({
            "model": self.cfg.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": self.cfg.temperature,
        });
        self.post_with_retries(&payload)
    }

    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        let mut payload = json!({
            "model": self.cfg.model,
            "messages": chat_messages_json(req),
            "max_tokens": req.max_tokens,
        });
        if let Some(temperature) = req.temperature {
            payload["temperature"] = json!(temperature);
        }
        if !req.tools.is_empty() {
            payload["tools"] = serde_json::to_value(&req.tools)?;
            payload["tool_choice"] = json!("auto");
        }
        self.post_with_retries(&payload)
    }
}

fn chat_messages_json(req: &ChatRequest) -> Vec<Value> {
    use shoestring_core::ChatMessage;
    req.messages
        .iter()
        .map(|m| match m {
            ChatMessage::System { content } => json!({"role": "system", "content": content}),
            ChatMessage::User { content } => json!({"role": "user", "content": content}),
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                let mut msg = json!({
                    "role": "assistant",
                    "content": content.clone().unwrap_or_default(),
                });
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = Value::Array(
                        tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {"name": tc.name, "arguments": tc.arguments},
                                })
                            })
                            .collect(),
                    );
                }
                msg
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
        })
        .collect()
}

fn parse_chat_payload(body: &str) -> Result<LlmResponse> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| anyhow!("invalid llm response json: {e}"))?;
    let choice = value
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| anyhow!("llm response has no choices"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| anyhow!("llm response choice has no message"))?;

    let text = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|f| f.as_str())
        .unwrap_or("stop")
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for call in calls {
            let id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            let Some(function) = call.get("function") else {
                continue;
            };
            let Some(name) = function.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let arguments = function
                .get("arguments")
                .and_then(|v| v.as_str())
                .unwrap_or("{}");
            tool_calls.push(LlmToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            });
        }
    }

    Ok(LlmResponse {
        text: strip_think_blocks(text),
        finish_reason,
        tool_calls,
    })
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_delay(base_ms: u64, attempt: u8) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.min(6)))
}

/// Remove `<think>…</think>` reasoning blocks before anything is stored in
/// session history. These blocks are internal monologue: keeping them
/// inflates context and makes the model believe it already took actions it
/// only thought about taking.
#[must_use]
pub fn strip_think_blocks(text: &str) -> String {
    static THINK_RE: OnceLock<Regex> = OnceLock::new();
    let re = THINK_RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
    re.replace_all(text, "").trim().to_string()
}

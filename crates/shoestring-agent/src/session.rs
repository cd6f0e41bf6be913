//! Bounded tool-calling conversation shared by both execution engines.

use crate::AgentEngine;
use anyhow::Result;
use serde_json::json;
use shoestring_core::{ChatMessage, ChatRequest, ToolCall, truncate_chars};

/// Run one chat session against the registry, giving the model only the
/// named tools, for at most `max_rounds` call/response rounds. Every tool
/// result (including `ERROR:` ones) is fed back verbatim; `on_result` sees
/// each call with its result. Returns the model's final text.
pub(crate) fn run_capability_session(
    engine: &AgentEngine,
    system: String,
    user: String,
    tool_names: &[String],
    max_tokens: u32,
    max_rounds: usize,
    mut on_result: impl FnMut(&ToolCall, &str),
) -> Result<String> {
    let tools = engine.tools.definitions_for(tool_names);
    let mut messages = vec![
        ChatMessage::System { content: system },
        ChatMessage::User { content: user },
    ];

    let mut response = engine.llm.complete_chat(&ChatRequest {
        messages: messages.clone(),
        tools: tools.clone(),
        max_tokens,
        temperature: None,
    })?;

    for _ in 0..max_rounds {
        if response.tool_calls.is_empty() {
            break;
        }
        messages.push(ChatMessage::Assistant {
            content: (!response.text.is_empty()).then(|| response.text.clone()),
            tool_calls: response.tool_calls.clone(),
        });
        for tc in &response.tool_calls {
            let args = serde_json::from_str(&tc.arguments).unwrap_or_else(|_| json!({}));
            let call = ToolCall {
                name: tc.name.clone(),
                args,
            };
            // The model only ever sees the tools it was given; asking for
            // anything else is answered, not executed.
            let result = if tool_names.contains(&call.name) {
                engine.tools.invoke(&call)
            } else {
                format!("ERROR: tool '{}' not available", call.name)
            };
            engine.observer.verbose_log(&format!(
                "{}({}) -> {}",
                call.name,
                truncate_chars(&tc.arguments, 80),
                truncate_chars(&result, 120)
            ));
            on_result(&call, &result);
            messages.push(ChatMessage::Tool {
                tool_call_id: tc.id.clone(),
                content: result,
            });
        }
        response = engine.llm.complete_chat(&ChatRequest {
            messages: messages.clone(),
            tools: tools.clone(),
            max_tokens,
            temperature: None,
        })?;
    }

    Ok(response.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedLlm, engine_with, text_response, tool_call_response};
    use serde_json::json;

    #[test]
    fn tool_results_flow_back_and_loop_ends_on_text() {
        let (dir, engine) = engine_with(
            ScriptedLlm::new(vec![
                tool_call_response(&[("c1", "read_file", json!({"path": "a.txt"}))]),
                text_response("done"),
            ]),
            |_| {},
        );
        std::fs::write(dir.path().join("a.txt"), "hello").expect("write");

        let mut seen = Vec::new();
        let text = run_capability_session(
            &engine,
            "sys".to_string(),
            "user".to_string(),
            &["read_file".to_string()],
            256,
            5,
            |call, result| seen.push((call.name.clone(), result.to_string())),
        )
        .expect("session");

        assert_eq!(text, "done");
        assert_eq!(seen, vec![("read_file".to_string(), "hello".to_string())]);
    }

    #[test]
    fn unlisted_tools_are_refused_not_invoked() {
        let (dir, engine) = engine_with(
            ScriptedLlm::new(vec![
                tool_call_response(&[(
                    "c1",
                    "write_file",
                    json!({"path": "x.txt", "content": "boo"}),
                )]),
                text_response("ok"),
            ]),
            |_| {},
        );

        let mut results = Vec::new();
        run_capability_session(
            &engine,
            "sys".to_string(),
            "user".to_string(),
            &["read_file".to_string()],
            256,
            5,
            |_, result| results.push(result.to_string()),
        )
        .expect("session");

        assert!(results[0].contains("not available"));
        assert!(!dir.path().join("x.txt").exists());
    }

    #[test]
    fn rounds_are_bounded() {
        let looping: Vec<_> = (0..10)
            .map(|_| tool_call_response(&[("call", "list_directory", json!({}))]))
            .collect();
        let (_dir, engine) = engine_with(ScriptedLlm::new(looping), |_| {});

        let mut calls = 0;
        let text = run_capability_session(
            &engine,
            "sys".to_string(),
            "user".to_string(),
            &["list_directory".to_string()],
            256,
            3,
            |_, _| calls += 1,
        )
        .expect("session");

        // Three rounds of tool calls, then the loop stops mid-conversation.
        assert_eq!(calls, 3);
        assert!(text.is_empty());
    }
}

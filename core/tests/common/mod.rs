#![allow(clippy::unwrap_used, dead_code)]

use std::path::Path;

use sable_core::config::Config;
use sable_core::config::ReasoningEffort;
use sable_core::config::ThinkingMode;
use sable_core::policy::PermissionMode;
use sable_core::providers::Dialect;
use sable_core::providers::ModelProviderInfo;
use wiremock::Respond;
use wiremock::ResponseTemplate;

/// Config wired to a mock provider endpoint and a throwaway home dir.
pub fn test_config(home: &Path, workspace: &Path, base_url: &str) -> Config {
    let provider = ModelProviderInfo {
        name: "Mock".to_string(),
        base_url: base_url.to_string(),
        env_key: "SABLE_TEST_API_KEY".to_string(),
        dialect: Dialect::OpenAiChat,
        default_model: "mock-model".to_string(),
        api_key_in_query: false,
    };
    Config {
        workspace: workspace.to_path_buf(),
        app_name: "sable".to_string(),
        model: "mock-model".to_string(),
        provider_id: "mock".to_string(),
        provider,
        permission_mode: PermissionMode::FullControl,
        sandbox_type: None,
        safe_commands: Vec::new(),
        stream: true,
        thinking_mode: ThinkingMode::Auto,
        thinking_budget: None,
        reasoning_effort: ReasoningEffort::Medium,
        compact_watermark: 0.7,
        context_window_tokens: 128_000,
        session_id: Some("itest".to_string()),
        home: home.to_path_buf(),
    }
}

/// Encode streaming chunks as an SSE body with the `[DONE]` terminator.
pub fn sse_body(chunks: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

pub fn sse_response(chunks: &[serde_json::Value]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_raw(sse_body(chunks), "text/event-stream")
}

/// Replies with each prepared response once, in order; panics when the agent
/// calls more often than the test scripted.
pub struct SequenceResponder {
    responses: Vec<ResponseTemplate>,
    next: std::sync::atomic::AtomicUsize,
}

impl SequenceResponder {
    pub fn new(responses: Vec<ResponseTemplate>) -> Self {
        Self {
            responses,
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

impl Respond for SequenceResponder {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        let index = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match self.responses.get(index) {
            Some(response) => response.clone(),
            None => panic!("provider called {} times, scripted {}", index + 1, self.responses.len()),
        }
    }
}

/// Text delta in the chat-completions streaming shape.
pub fn text_delta(text: &str) -> serde_json::Value {
    serde_json::json!({"choices": [{"delta": {"content": text}}]})
}

pub fn finish(reason: &str) -> serde_json::Value {
    serde_json::json!({"choices": [{"delta": {}, "finish_reason": reason}]})
}

pub fn tool_call_delta(id: &str, name: &str, args: &str) -> serde_json::Value {
    serde_json::json!({"choices": [{"delta": {"tool_calls": [{
        "index": 0, "id": id,
        "function": {"name": name, "arguments": args}
    }]}}]})
}

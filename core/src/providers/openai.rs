//! Codec for OpenAI-style chat completions, covering both the classic
//! dialect and the compatible endpoints (DeepSeek, Xiaomi, ...) that stream
//! `reasoning_content` deltas and take a `thinking.type` switch.

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use sable_protocol::Message;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use crate::client_common::Prompt;
use crate::client_common::ResponseChunk;
use crate::client_common::ResponseStream;
use crate::client_common::StreamAccumulator;
use crate::client_common::TokenUsage;
use crate::error::Result;
use crate::error::SableErr;
use crate::flags::SABLE_STREAM_IDLE_TIMEOUT_MS;
use crate::providers::Dialect;
use crate::providers::ModelProviderInfo;
use crate::providers::RemoteModel;
use crate::providers::send_with_retries;

pub(crate) async fn generate(
    prompt: &Prompt,
    model: &str,
    client: &reqwest::Client,
    provider: &ModelProviderInfo,
) -> Result<ResponseStream> {
    let payload = build_payload(prompt, model, provider);
    let base_url = provider.base_url.trim_end_matches('/');
    let url = format!("{base_url}/chat/completions");
    debug!("POST to {url}");
    trace!(
        "request payload: {}",
        serde_json::to_string(&payload).unwrap_or_default()
    );

    let api_key = provider.api_key();
    let resp = send_with_retries(|| {
        let mut req = client.post(&url);
        if let Some(api_key) = &api_key {
            req = req.bearer_auth(api_key.clone());
        }
        req.header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&payload)
    })
    .await?;

    let (tx_chunk, rx_chunk) = mpsc::channel::<Result<ResponseChunk>>(16);
    if prompt.stream {
        let stream = resp.bytes_stream().map_err(SableErr::Reqwest);
        tokio::spawn(process_sse(stream, tx_chunk));
    } else {
        tokio::spawn(async move {
            let chunk = decode_full_response(resp).await;
            let _ = tx_chunk.send(chunk).await;
        });
    }
    Ok(ResponseStream { rx_chunk })
}

fn build_payload(prompt: &Prompt, model: &str, provider: &ModelProviderInfo) -> Value {
    let mut messages = Vec::<Value>::new();
    for message in &prompt.messages {
        match message {
            Message::System { text } => {
                messages.push(json!({"role": "system", "content": text}));
            }
            Message::User { text } => {
                messages.push(json!({"role": "user", "content": text}));
            }
            Message::Assistant {
                text, tool_calls, ..
            } => {
                let mut entry = json!({"role": "assistant"});
                if text.is_empty() && !tool_calls.is_empty() {
                    entry["content"] = Value::Null;
                } else {
                    entry["content"] = Value::String(text.clone());
                }
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": Value::Object(call.args.clone()).to_string(),
                                }
                            })
                        })
                        .collect();
                }
                messages.push(entry);
            }
            Message::Tool { tool_response } => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_response.id,
                    "content": Value::Object(tool_response.result.clone()).to_string(),
                }));
            }
        }
    }

    let tools: Vec<Value> = prompt
        .tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect();

    let mut payload = json!({
        "model": model,
        "messages": messages,
        "stream": prompt.stream,
    });
    if !tools.is_empty() {
        payload["tools"] = Value::Array(tools);
    }

    match provider.dialect {
        // The effort knob; omitted when thinking is explicitly off.
        Dialect::OpenAiChat => {
            if prompt.reasoning.enabled() != Some(false) {
                payload["reasoning_effort"] = json!(prompt.reasoning.effort.to_string());
            }
        }
        // Compat endpoints use an explicit enable/disable switch.
        Dialect::OpenAiCompat => {
            if let Some(enabled) = prompt.reasoning.enabled() {
                let kind = if enabled { "enabled" } else { "disabled" };
                payload["thinking"] = json!({"type": kind});
            }
        }
        _ => {}
    }
    payload
}

pub(crate) async fn process_sse<S>(stream: S, tx_chunk: mpsc::Sender<Result<ResponseChunk>>)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();
    let idle_timeout = *SABLE_STREAM_IDLE_TIMEOUT_MS;
    let mut acc = StreamAccumulator::default();
    let mut usage: Option<TokenUsage> = None;

    loop {
        let sse = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(sse))) => sse,
            Ok(Some(Err(e))) => {
                let _ = tx_chunk
                    .send(Err(SableErr::Stream(e.to_string(), None)))
                    .await;
                return;
            }
            Ok(None) => {
                // Stream closed without [DONE]; finish with what we have.
                let _ = tx_chunk
                    .send(Ok(ResponseChunk::TurnComplete {
                        message: acc.finish(),
                        usage,
                    }))
                    .await;
                return;
            }
            Err(_) => {
                let _ = tx_chunk
                    .send(Err(SableErr::Stream("idle timeout waiting for SSE".into(), None)))
                    .await;
                return;
            }
        };

        if sse.data.trim() == "[DONE]" {
            let _ = tx_chunk
                .send(Ok(ResponseChunk::TurnComplete {
                    message: acc.finish(),
                    usage,
                }))
                .await;
            return;
        }

        let chunk: Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx_chunk
                    .send(Err(SableErr::ProviderDecode(format!(
                        "bad SSE chunk: {e}"
                    ))))
                    .await;
                return;
            }
        };
        trace!("chat_completions SSE chunk: {chunk:?}");

        if let Some(u) = chunk.get("usage").filter(|u| !u.is_null()) {
            usage = Some(TokenUsage {
                input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
                output_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
            });
        }

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            continue;
        };
        let delta = &choice["delta"];

        if let Some(content) = delta.get("content").and_then(Value::as_str)
            && !content.is_empty()
        {
            acc.push_text(content);
            if tx_chunk
                .send(Ok(ResponseChunk::TextDelta(content.to_string())))
                .await
                .is_err()
            {
                return;
            }
        }

        if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str)
            && !reasoning.is_empty()
        {
            acc.push_reasoning(reasoning);
            if tx_chunk
                .send(Ok(ResponseChunk::ReasoningDelta(reasoning.to_string())))
                .await
                .is_err()
            {
                return;
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for tool_call in tool_calls {
                let index = tool_call["index"].as_u64().unwrap_or(0) as usize;
                if let Some(id) = tool_call.get("id").and_then(Value::as_str) {
                    acc.tool_call_id(index, id);
                }
                if let Some(function) = tool_call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        acc.tool_call_name(index, name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        acc.tool_call_args_fragment(index, args);
                    }
                }
            }
        }

        if choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .is_some()
        {
            let _ = tx_chunk
                .send(Ok(ResponseChunk::TurnComplete {
                    message: acc.finish(),
                    usage,
                }))
                .await;
            return;
        }
    }
}

async fn decode_full_response(resp: reqwest::Response) -> Result<ResponseChunk> {
    let body: Value = resp.json().await?;
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| SableErr::ProviderDecode("response without choices".into()))?;
    let message = &choice["message"];

    let mut acc = StreamAccumulator::default();
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        acc.push_text(text);
    }
    if let Some(reasoning) = message.get("reasoning_content").and_then(Value::as_str) {
        acc.push_reasoning(reasoning);
    }
    if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (index, tool_call) in tool_calls.iter().enumerate() {
            if let Some(id) = tool_call.get("id").and_then(Value::as_str) {
                acc.tool_call_id(index, id);
            }
            if let Some(function) = tool_call.get("function") {
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    acc.tool_call_name(index, name);
                }
                if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                    acc.tool_call_args_fragment(index, args);
                }
            }
        }
    }

    let usage = body.get("usage").map(|u| TokenUsage {
        input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
    });

    Ok(ResponseChunk::TurnComplete {
        message: acc.finish(),
        usage,
    })
}

pub(crate) async fn discover(
    client: &reqwest::Client,
    provider: &ModelProviderInfo,
) -> Result<Vec<RemoteModel>> {
    let base_url = provider.base_url.trim_end_matches('/');
    let url = format!("{base_url}/models");
    let api_key = provider.api_key();
    let resp = send_with_retries(|| {
        let mut req = client.get(&url);
        if let Some(api_key) = &api_key {
            req = req.bearer_auth(api_key.clone());
        }
        req
    })
    .await?;

    let body: Value = resp.json().await?;
    let Some(data) = body.get("data").and_then(Value::as_array) else {
        return Err(SableErr::ProviderDecode("model list without data".into()));
    };
    Ok(data
        .iter()
        .filter_map(|m| m.get("id").and_then(Value::as_str))
        .map(|id| RemoteModel {
            name: id.to_string(),
            context_window_tokens: None,
            max_output_tokens: None,
            capabilities: Vec::new(),
        })
        .collect())
}

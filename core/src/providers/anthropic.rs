//! Codec for the Anthropic messages API: `x-api-key` auth, top-level
//! `system`, `tool_use`/`tool_result` content blocks, and the
//! `thinking.{type,budget_tokens}` switch.

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
use crate::providers::ModelProviderInfo;
use crate::providers::RemoteModel;
use crate::providers::send_with_retries;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8_192;

pub(crate) async fn generate(
    prompt: &Prompt,
    model: &str,
    client: &reqwest::Client,
    provider: &ModelProviderInfo,
) -> Result<ResponseStream> {
    let payload = build_payload(prompt, model);
    let base_url = provider.base_url.trim_end_matches('/');
    let url = format!("{base_url}/v1/messages");
    debug!("POST to {url}");

    let api_key = provider.api_key().unwrap_or_default();
    let resp = send_with_retries(|| {
        client
            .post(&url)
            .header("x-api-key", api_key.clone())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(reqwest::header::ACCEPT, "text/event-stream")
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

/// The messages API wants system text at the top level and strictly
/// alternating user/assistant turns, so system messages are hoisted and
/// same-role runs are merged into multi-block entries.
fn build_payload(prompt: &Prompt, model: &str) -> Value {
    let mut system = String::new();
    let mut messages = Vec::<Value>::new();

    for message in &prompt.messages {
        match message {
            Message::System { text } => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(text);
            }
            Message::User { text } => {
                push_blocks(
                    &mut messages,
                    "user",
                    vec![json!({"type": "text", "text": text})],
                );
            }
            Message::Assistant {
                text,
                reasoning: _,
                tool_calls,
            } => {
                let mut blocks = Vec::new();
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for call in tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": Value::Object(call.args.clone()),
                    }));
                }
                if !blocks.is_empty() {
                    push_blocks(&mut messages, "assistant", blocks);
                }
            }
            Message::Tool { tool_response } => {
                // Tool results travel back as user-role content blocks.
                push_blocks(
                    &mut messages,
                    "user",
                    vec![json!({
                        "type": "tool_result",
                        "tool_use_id": tool_response.id,
                        "content": Value::Object(tool_response.result.clone()).to_string(),
                    })],
                );
            }
        }
    }

    let tools: Vec<Value> = prompt
        .tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.parameters,
            })
        })
        .collect();

    let mut payload = json!({
        "model": model,
        "max_tokens": DEFAULT_MAX_TOKENS,
        "messages": messages,
        "stream": prompt.stream,
    });
    if !system.is_empty() {
        payload["system"] = Value::String(system);
    }
    if !tools.is_empty() {
        payload["tools"] = Value::Array(tools);
    }
    if prompt.reasoning.enabled() == Some(true) {
        let budget = prompt.reasoning.budget_tokens.unwrap_or(1_024);
        payload["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
    }
    payload
}

fn push_blocks(messages: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if let Some(last) = messages.last_mut()
        && last["role"] == role
        && let Some(content) = last["content"].as_array_mut()
    {
        content.extend(blocks);
        return;
    }
    messages.push(json!({"role": role, "content": blocks}));
}

pub(crate) async fn process_sse<S>(stream: S, tx_chunk: mpsc::Sender<Result<ResponseChunk>>)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();
    let idle_timeout = *SABLE_STREAM_IDLE_TIMEOUT_MS;
    let mut acc = StreamAccumulator::default();
    let mut usage = TokenUsage::default();
    // Maps the provider's content-block index onto accumulator slots for
    // tool_use blocks.
    let mut tool_block_indices = std::collections::HashMap::<usize, usize>::new();
    let mut next_tool_slot = 0usize;

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
                let _ = tx_chunk
                    .send(Ok(ResponseChunk::TurnComplete {
                        message: acc.finish(),
                        usage: Some(usage),
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

        let event: Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx_chunk
                    .send(Err(SableErr::ProviderDecode(format!("bad SSE chunk: {e}"))))
                    .await;
                return;
            }
        };
        trace!("anthropic SSE event: {event:?}");

        match event["type"].as_str().unwrap_or_default() {
            "message_start" => {
                if let Some(u) = event.pointer("/message/usage") {
                    usage.input_tokens = u["input_tokens"].as_u64().unwrap_or(0);
                }
            }
            "content_block_start" => {
                let index = event["index"].as_u64().unwrap_or(0) as usize;
                let block = &event["content_block"];
                if block["type"] == "tool_use" {
                    let slot = next_tool_slot;
                    next_tool_slot += 1;
                    tool_block_indices.insert(index, slot);
                    if let Some(id) = block["id"].as_str() {
                        acc.tool_call_id(slot, id);
                    }
                    if let Some(name) = block["name"].as_str() {
                        acc.tool_call_name(slot, name);
                    }
                }
            }
            "content_block_delta" => {
                let index = event["index"].as_u64().unwrap_or(0) as usize;
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str() {
                            acc.push_text(text);
                            if tx_chunk
                                .send(Ok(ResponseChunk::TextDelta(text.to_string())))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(thinking) = delta["thinking"].as_str() {
                            acc.push_reasoning(thinking);
                            if tx_chunk
                                .send(Ok(ResponseChunk::ReasoningDelta(thinking.to_string())))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let (Some(slot), Some(fragment)) = (
                            tool_block_indices.get(&index),
                            delta["partial_json"].as_str(),
                        ) {
                            acc.tool_call_args_fragment(*slot, fragment);
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(u) = event.get("usage") {
                    usage.output_tokens = u["output_tokens"].as_u64().unwrap_or(0);
                }
            }
            "message_stop" => {
                let _ = tx_chunk
                    .send(Ok(ResponseChunk::TurnComplete {
                        message: acc.finish(),
                        usage: Some(usage),
                    }))
                    .await;
                return;
            }
            // ping, content_block_stop, error passthroughs
            "error" => {
                let message = event
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("provider error");
                let _ = tx_chunk
                    .send(Err(SableErr::ProviderDecode(message.to_string())))
                    .await;
                return;
            }
            _ => {}
        }
    }
}

async fn decode_full_response(resp: reqwest::Response) -> Result<ResponseChunk> {
    let body: Value = resp.json().await?;
    let mut acc = StreamAccumulator::default();
    let mut slot = 0usize;
    if let Some(blocks) = body["content"].as_array() {
        for block in blocks {
            match block["type"].as_str().unwrap_or_default() {
                "text" => acc.push_text(block["text"].as_str().unwrap_or_default()),
                "thinking" => acc.push_reasoning(block["thinking"].as_str().unwrap_or_default()),
                "tool_use" => {
                    if let Some(id) = block["id"].as_str() {
                        acc.tool_call_id(slot, id);
                    }
                    if let Some(name) = block["name"].as_str() {
                        acc.tool_call_name(slot, name);
                    }
                    if let Some(input) = block["input"].as_object() {
                        acc.tool_call_args_object(slot, input.clone());
                    }
                    slot += 1;
                }
                _ => {}
            }
        }
    }
    let usage = body.get("usage").map(|u| TokenUsage {
        input_tokens: u["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: u["output_tokens"].as_u64().unwrap_or(0),
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
    let url = format!("{base_url}/v1/models");
    let api_key = provider.api_key().unwrap_or_default();
    let resp = send_with_retries(|| {
        client
            .get(&url)
            .header("x-api-key", api_key.clone())
            .header("anthropic-version", ANTHROPIC_VERSION)
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

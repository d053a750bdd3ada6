//! Codec for the Gemini content API: key-in-URL auth, `systemInstruction`,
//! `functionCall`/`functionResponse` parts, `thinkingConfig` budgets, and the
//! per-call `thoughtSignature` that must be echoed back verbatim for the
//! tool loop to stay valid.

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
use tracing::warn;

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

pub(crate) async fn generate(
    prompt: &Prompt,
    model: &str,
    client: &reqwest::Client,
    provider: &ModelProviderInfo,
) -> Result<ResponseStream> {
    let payload = build_payload(prompt);
    let base_url = provider.base_url.trim_end_matches('/');
    let verb = if prompt.stream {
        "streamGenerateContent"
    } else {
        "generateContent"
    };
    let url = format!("{base_url}/models/{model}:{verb}");
    debug!("POST to {url}");

    let api_key = provider.api_key();
    let key_in_query = provider.api_key_in_query;
    let streaming = prompt.stream;
    let resp = send_with_retries(|| {
        let mut req = client.post(&url);
        if streaming {
            req = req.query(&[("alt", "sse")]);
        }
        match (&api_key, key_in_query) {
            (Some(key), true) => req = req.query(&[("key", key.clone())]),
            (Some(key), false) => req = req.bearer_auth(key.clone()),
            (None, _) => {}
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

fn build_payload(prompt: &Prompt) -> Value {
    let mut system = String::new();
    let mut contents = Vec::<Value>::new();

    for message in &prompt.messages {
        match message {
            Message::System { text } => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(text);
            }
            Message::User { text } => {
                contents.push(json!({"role": "user", "parts": [{"text": text}]}));
            }
            Message::Assistant {
                text, tool_calls, ..
            } => {
                let mut parts = Vec::new();
                if !text.is_empty() {
                    parts.push(json!({"text": text}));
                }
                for call in tool_calls {
                    // A functionCall may only be replayed with the signature
                    // the provider attached; unsigned calls are dropped on
                    // re-encode.
                    let Some(signature) = &call.thought_signature else {
                        warn!("dropping unsigned functionCall {} on re-encode", call.name);
                        continue;
                    };
                    parts.push(json!({
                        "functionCall": {
                            "name": call.name,
                            "args": Value::Object(call.args.clone()),
                        },
                        "thoughtSignature": signature,
                    }));
                }
                if !parts.is_empty() {
                    contents.push(json!({"role": "model", "parts": parts}));
                }
            }
            Message::Tool { tool_response } => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": tool_response.name,
                            "response": Value::Object(tool_response.result.clone()),
                        }
                    }]
                }));
            }
        }
    }

    let mut payload = json!({"contents": contents});
    if !system.is_empty() {
        payload["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    if !prompt.tools.is_empty() {
        let declarations: Vec<Value> = prompt
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect();
        payload["tools"] = json!([{"functionDeclarations": declarations}]);
    }
    if prompt.reasoning.enabled() == Some(true)
        && let Some(budget) = prompt.reasoning.budget_tokens
    {
        payload["generationConfig"] = json!({"thinkingConfig": {"thinkingBudget": budget}});
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
                // Gemini has no explicit terminator; the stream just ends.
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

        let chunk: Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx_chunk
                    .send(Err(SableErr::ProviderDecode(format!("bad SSE chunk: {e}"))))
                    .await;
                return;
            }
        };
        trace!("gemini SSE chunk: {chunk:?}");

        if let Some(meta) = chunk.get("usageMetadata") {
            usage = Some(TokenUsage {
                input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0),
                output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0),
            });
        }

        let Some(parts) = chunk
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        else {
            continue;
        };

        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                    acc.push_reasoning(text);
                    if tx_chunk
                        .send(Ok(ResponseChunk::ReasoningDelta(text.to_string())))
                        .await
                        .is_err()
                    {
                        return;
                    }
                } else {
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

            if let Some(call) = part.get("functionCall") {
                let slot = next_tool_slot;
                next_tool_slot += 1;
                if let Some(name) = call["name"].as_str() {
                    acc.tool_call_name(slot, name);
                }
                if let Some(args) = call["args"].as_object() {
                    acc.tool_call_args_object(slot, args.clone());
                }
                if let Some(signature) = part.get("thoughtSignature").and_then(Value::as_str) {
                    acc.tool_call_signature(slot, signature);
                }
            }
        }
    }
}

async fn decode_full_response(resp: reqwest::Response) -> Result<ResponseChunk> {
    let body: Value = resp.json().await?;
    let mut acc = StreamAccumulator::default();
    let mut slot = 0usize;
    if let Some(parts) = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                    acc.push_reasoning(text);
                } else {
                    acc.push_text(text);
                }
            }
            if let Some(call) = part.get("functionCall") {
                if let Some(name) = call["name"].as_str() {
                    acc.tool_call_name(slot, name);
                }
                if let Some(args) = call["args"].as_object() {
                    acc.tool_call_args_object(slot, args.clone());
                }
                if let Some(signature) = part.get("thoughtSignature").and_then(Value::as_str) {
                    acc.tool_call_signature(slot, signature);
                }
                slot += 1;
            }
        }
    }
    let usage = body.get("usageMetadata").map(|meta| TokenUsage {
        input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0),
        output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0),
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
    let key_in_query = provider.api_key_in_query;
    let resp = send_with_retries(|| {
        let mut req = client.get(&url);
        match (&api_key, key_in_query) {
            (Some(key), true) => req = req.query(&[("key", key.clone())]),
            (Some(key), false) => req = req.bearer_auth(key.clone()),
            (None, _) => {}
        }
        req
    })
    .await?;

    let body: Value = resp.json().await?;
    let Some(models) = body.get("models").and_then(Value::as_array) else {
        return Err(SableErr::ProviderDecode("model list without models".into()));
    };
    Ok(models
        .iter()
        .filter_map(|m| {
            let name = m.get("name").and_then(Value::as_str)?;
            Some(RemoteModel {
                name: name.trim_start_matches("models/").to_string(),
                context_window_tokens: m["inputTokenLimit"].as_u64().map(|v| v as u32),
                max_output_tokens: m["outputTokenLimit"].as_u64().map(|v| v as u32),
                capabilities: m["supportedGenerationMethods"]
                    .as_array()
                    .map(|methods| {
                        methods
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            })
        })
        .collect())
}

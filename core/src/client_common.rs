use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use sable_protocol::Message;
use sable_protocol::ToolCall;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use sha1::Digest;
use sha1::Sha1;
use tokio::sync::mpsc;

use crate::config::ReasoningEffort;
use crate::config::ThinkingMode;
use crate::error::Result;

/// A tool surfaced to the model, already reduced to the JSON-schema shape
/// every dialect understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The three reasoning knobs from config, translated per dialect: `effort`
/// for effort-shaped APIs, `enabled` + `budget_tokens` for explicit
/// thinking-config APIs, silently ignored elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct ReasoningControls {
    pub mode: ThinkingMode,
    pub budget_tokens: Option<u32>,
    pub effort: ReasoningEffort,
}

impl ReasoningControls {
    /// Resolved enable bit: `auto` leaves it to the provider default.
    pub fn enabled(&self) -> Option<bool> {
        match self.mode {
            ThinkingMode::Auto => None,
            ThinkingMode::On => Some(true),
            ThinkingMode::Off => Some(false),
        }
    }
}

/// One model request: the window messages plus tools and controls.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    pub reasoning: ReasoningControls,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Streamed unit produced by every adapter: partial deltas while the model
/// is talking, then exactly one `TurnComplete` carrying the merged message.
#[derive(Debug)]
pub enum ResponseChunk {
    TextDelta(String),
    ReasoningDelta(String),
    TurnComplete {
        message: Message,
        usage: Option<TokenUsage>,
    },
}

pub struct ResponseStream {
    pub(crate) rx_chunk: mpsc::Receiver<Result<ResponseChunk>>,
}

impl Stream for ResponseStream {
    type Item = Result<ResponseChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_chunk.poll_recv(cx)
    }
}

/// Accumulates streaming deltas into the final assistant message. Tool calls
/// are gathered per stream index because providers interleave fragments of
/// several calls.
#[derive(Default)]
pub struct StreamAccumulator {
    text: String,
    reasoning: String,
    tool_calls: BTreeMap<usize, PartialToolCall>,
}

#[derive(Default, Clone)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
    args_object: Option<Map<String, Value>>,
    thought_signature: Option<String>,
}

impl StreamAccumulator {
    pub fn push_text(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    pub fn push_reasoning(&mut self, delta: &str) {
        self.reasoning.push_str(delta);
    }

    pub fn tool_call_id(&mut self, index: usize, id: &str) {
        let call = self.tool_calls.entry(index).or_default();
        if call.id.is_empty() {
            call.id = id.to_string();
        }
    }

    pub fn tool_call_name(&mut self, index: usize, name: &str) {
        let call = self.tool_calls.entry(index).or_default();
        if call.name.is_empty() {
            call.name = name.to_string();
        }
    }

    /// Append a fragment of the JSON-encoded arguments string.
    pub fn tool_call_args_fragment(&mut self, index: usize, fragment: &str) {
        self.tool_calls
            .entry(index)
            .or_default()
            .arguments
            .push_str(fragment);
    }

    /// Set fully-formed arguments (non-streaming dialects).
    pub fn tool_call_args_object(&mut self, index: usize, args: Map<String, Value>) {
        self.tool_calls.entry(index).or_default().args_object = Some(args);
    }

    pub fn tool_call_signature(&mut self, index: usize, signature: &str) {
        self.tool_calls.entry(index).or_default().thought_signature =
            Some(signature.to_string());
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Merge into the final assistant message, deduplicating tool calls by
    /// `(id | name, args-hash)` with later fields overriding earlier ones.
    /// Emission order is preserved; dispatch depends on it.
    pub fn finish(self) -> Message {
        let mut merged: Vec<(String, ToolCall)> = Vec::new();
        for (_, partial) in self.tool_calls {
            let args = partial.args_object.unwrap_or_else(|| {
                serde_json::from_str::<Map<String, Value>>(&partial.arguments).unwrap_or_default()
            });
            let call = ToolCall {
                id: partial.id,
                name: partial.name,
                args,
                thought_signature: partial.thought_signature,
            };
            let key = dedup_key(&call);
            match merged.iter_mut().find(|(k, _)| *k == key) {
                Some((_, existing)) => {
                    if !call.id.is_empty() {
                        existing.id = call.id;
                    }
                    if !call.name.is_empty() {
                        existing.name = call.name;
                    }
                    if !call.args.is_empty() {
                        existing.args = call.args;
                    }
                    if call.thought_signature.is_some() {
                        existing.thought_signature = call.thought_signature;
                    }
                }
                None => merged.push((key, call)),
            }
        }

        Message::Assistant {
            text: self.text,
            reasoning: self.reasoning,
            tool_calls: merged.into_iter().map(|(_, call)| call).collect(),
        }
    }
}

fn dedup_key(call: &ToolCall) -> String {
    let ident = if call.id.is_empty() {
        &call.name
    } else {
        &call.id
    };
    let mut hasher = Sha1::new();
    hasher.update(Value::Object(call.args.clone()).to_string().as_bytes());
    format!("{ident}:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn accumulator_merges_fragmented_args() {
        let mut acc = StreamAccumulator::default();
        acc.push_text("Hello");
        acc.tool_call_id(0, "c1");
        acc.tool_call_name(0, "READ");
        acc.tool_call_args_fragment(0, "{\"path\":");
        acc.tool_call_args_fragment(0, "\"README.md\"}");

        let message = acc.finish();
        let calls = message.tool_calls();
        assert_eq!(1, calls.len());
        assert_eq!("c1", calls[0].id);
        assert_eq!(json!("README.md"), calls[0].args["path"]);
        assert_eq!("Hello", message.text());
    }

    #[test]
    fn duplicate_calls_dedup_with_later_fields_winning() {
        let mut acc = StreamAccumulator::default();
        let args = json!({"command": "ls"}).as_object().unwrap().clone();

        acc.tool_call_id(0, "c1");
        acc.tool_call_name(0, "BASH");
        acc.tool_call_args_object(0, args.clone());

        // Same id and args at a later index, now carrying a signature.
        acc.tool_call_id(1, "c1");
        acc.tool_call_name(1, "BASH");
        acc.tool_call_args_object(1, args);
        acc.tool_call_signature(1, "sig-2");

        let message = acc.finish();
        let calls = message.tool_calls();
        assert_eq!(1, calls.len());
        assert_eq!(Some("sig-2".to_string()), calls[0].thought_signature);
    }

    #[test]
    fn distinct_args_are_not_deduped() {
        let mut acc = StreamAccumulator::default();
        acc.tool_call_id(0, "c1");
        acc.tool_call_name(0, "READ");
        acc.tool_call_args_object(0, json!({"path": "a"}).as_object().unwrap().clone());
        acc.tool_call_id(1, "c1");
        acc.tool_call_name(1, "READ");
        acc.tool_call_args_object(1, json!({"path": "b"}).as_object().unwrap().clone());

        assert_eq!(2, acc.finish().tool_calls().len());
    }
}

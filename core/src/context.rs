//! Turns the post-compaction event suffix into the ordered message list a
//! provider adapter consumes, and reports how full the context window is.

use sable_protocol::Event;
use sable_protocol::Message;
use sable_protocol::Role;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowUsage {
    pub used_tokens: u32,
    pub budget_tokens: u32,
    pub ratio: f32,
}

impl WindowUsage {
    pub fn over_watermark(&self, watermark: f32) -> bool {
        self.ratio >= watermark
    }
}

/// Translate window events into model messages. Partial chunks are dropped
/// (superseded by the non-partial event of the same turn) and lifecycle
/// markers never reach the model.
pub fn build_messages(events: &[Event]) -> Vec<Message> {
    events
        .iter()
        .filter(|e| !e.is_partial() && !e.is_lifecycle())
        .map(|e| e.message.clone())
        .collect()
}

pub fn usage(messages: &[Message], budget_tokens: u32) -> WindowUsage {
    let used_tokens = messages.iter().map(estimate_message_tokens).sum();
    let ratio = if budget_tokens == 0 {
        1.0
    } else {
        used_tokens as f32 / budget_tokens as f32
    };
    WindowUsage {
        used_tokens,
        budget_tokens,
        ratio,
    }
}

/// Default token estimator: `ceil(rune_count / 4)` per line with a floor of
/// one token per non-empty line. Adapters with a real tokenizer may
/// substitute their own; this one only has to be stable and monotone.
pub fn estimate_tokens(text: &str) -> u32 {
    text.lines()
        .map(|line| {
            let runes = line.chars().count() as u32;
            if runes == 0 {
                0
            } else {
                runes.div_ceil(4).max(1)
            }
        })
        .sum()
}

pub fn estimate_message_tokens(message: &Message) -> u32 {
    let mut total = estimate_tokens(message.text());
    if let Message::Assistant {
        reasoning,
        tool_calls,
        ..
    } = message
    {
        total += estimate_tokens(reasoning);
        for call in tool_calls {
            total += estimate_tokens(&serde_json::Value::Object(call.args.clone()).to_string());
        }
    }
    if let Message::Tool { tool_response } = message {
        total +=
            estimate_tokens(&serde_json::Value::Object(tool_response.result.clone()).to_string());
    }
    total
}

/// Collapse runs of same-role messages into one, joined with blank lines.
/// Only dialects that reject consecutive same-role turns call this.
pub fn merge_consecutive_same_role(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        let mergeable = matches!(message.role(), Role::User | Role::System);
        match merged.last_mut() {
            Some(prev) if mergeable && prev.role() == message.role() => {
                let joined = format!("{}\n\n{}", prev.text(), message.text());
                *prev = match message.role() {
                    Role::System => Message::system(joined),
                    _ => Message::user(joined),
                };
            }
            _ => merged.push(message),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use sable_protocol::Lifecycle;
    use sable_protocol::SessionId;
    use sable_protocol::meta;
    use serde_json::Value;

    use super::*;

    fn session() -> SessionId {
        SessionId::new("sable", "local", "ctx").unwrap()
    }

    fn partial(text: &str) -> Event {
        let mut meta_map = sable_protocol::EventMeta::new();
        meta_map.insert(meta::PARTIAL.to_string(), Value::Bool(true));
        meta_map.insert(
            meta::CHANNEL.to_string(),
            Value::String(meta::CHANNEL_ANSWER.to_string()),
        );
        Event::new(&session(), Message::assistant(text)).with_meta(meta_map)
    }

    #[test]
    fn partials_and_lifecycle_are_dropped() {
        let events = vec![
            Event::new(&session(), Message::user("hi")),
            partial("He"),
            partial("llo"),
            Event::new(&session(), Message::assistant("Hello")),
            Event::new(&session(), Message::system("")).with_meta(Lifecycle::completed().into_meta()),
        ];

        let messages = build_messages(&events);
        assert_eq!(2, messages.len());
        assert_eq!("Hello", messages[1].text());
    }

    #[test]
    fn estimator_floors_nonempty_lines() {
        // "a\n\nbbbb" → 1 + 0 + 1
        assert_eq!(2, estimate_tokens("a\n\nbbbb"));
        assert_eq!(0, estimate_tokens(""));
        assert_eq!(3, estimate_tokens("aaaaaaaaab")); // ceil(10/4)
    }

    #[test]
    fn ratio_reflects_budget() {
        let messages = vec![Message::user("aaaa".repeat(100))]; // 100 tokens
        let usage = usage(&messages, 1000);
        assert_eq!(100, usage.used_tokens);
        assert!((usage.ratio - 0.1).abs() < f32::EPSILON);
        assert!(!usage.over_watermark(0.5));
        assert!(usage.over_watermark(0.1));
    }

    #[test]
    fn merge_collapses_user_runs_only() {
        let messages = vec![
            Message::user("a"),
            Message::user("b"),
            Message::assistant("x"),
            Message::assistant("y"),
        ];
        let merged = merge_consecutive_same_role(messages);
        assert_eq!(3, merged.len());
        assert_eq!("a\n\nb", merged[0].text());
    }
}

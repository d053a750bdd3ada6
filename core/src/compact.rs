//! Compactor: folds the current context window into one synthetic system
//! event that becomes the new cutpoint. Everything before it stops counting
//! against the window.

use futures::StreamExt;
use sable_protocol::Event;
use sable_protocol::EventMeta;
use sable_protocol::Message;
use sable_protocol::SessionId;
use sable_protocol::meta;
use serde_json::Value;
use tracing::info;

use crate::client_common::Prompt;
use crate::client_common::ReasoningControls;
use crate::client_common::ResponseChunk;
use crate::context;
use crate::error::Result;
use crate::error::SableErr;
use crate::providers::ModelClient;
use crate::store::EventStore;

const SUMMARIZE_PROMPT: &str = "Summarize the conversation above for your own future reference. \
     Keep every fact, decision, file path and unresolved question; drop \
     pleasantries and dead ends. Reply with the summary only.";

/// Windows smaller than this are not worth a model call.
const MIN_WINDOW_MESSAGES: usize = 2;

/// Summarize the current window and append the compaction event. Returns
/// `None` when the window was too small to bother.
pub async fn run(
    store: &EventStore,
    session: &SessionId,
    client: &ModelClient,
    reasoning: ReasoningControls,
) -> Result<Option<Event>> {
    let events = store.list_context_window_events(session).await?;
    let mut messages = context::build_messages(&events);
    if messages.len() < MIN_WINDOW_MESSAGES {
        return Ok(None);
    }
    messages.push(Message::system(SUMMARIZE_PROMPT));

    // No tools, no streaming: one shot, one summary.
    let prompt = Prompt {
        messages,
        tools: Vec::new(),
        stream: false,
        reasoning,
    };
    let mut stream = client.generate(&prompt).await?;
    let mut summary = None;
    while let Some(chunk) = stream.next().await {
        if let ResponseChunk::TurnComplete { message, .. } = chunk? {
            summary = Some(message.text().to_string());
        }
    }
    let Some(summary) = summary else {
        return Err(SableErr::ProviderDecode(
            "compaction call returned no final message".into(),
        ));
    };
    if summary.is_empty() {
        return Err(SableErr::ProviderDecode(
            "compaction call returned an empty summary".into(),
        ));
    }

    let event = Event::new(session, Message::system(summary)).with_meta(compaction_meta());
    store.append_event(session, &event).await?;
    info!("compacted window into event {}", event.id);
    Ok(Some(event))
}

fn compaction_meta() -> EventMeta {
    let mut map = EventMeta::new();
    map.insert(
        meta::KIND.to_string(),
        Value::String(meta::KIND_COMPACTION.to_string()),
    );
    map.insert(
        meta::CONTRACT_VERSION.to_string(),
        Value::String(meta::CONTRACT_V1.to_string()),
    );
    map
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use sable_protocol::SessionId;

    use super::*;

    #[test]
    fn compaction_meta_marks_the_cutpoint() {
        let session = SessionId::new("sable", "local", "compact").unwrap();
        let event =
            Event::new(&session, Message::system("summary")).with_meta(compaction_meta());
        assert!(event.is_compaction());
        assert!(!event.is_lifecycle());
    }
}

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use strum_macros::Display;
use uuid::Uuid;

use crate::Message;
use crate::SessionId;

/// Well-known keys inside [`Event::meta`].
pub mod meta {
    /// `bool` — chunk of an in-progress assistant turn, superseded by a
    /// later non-partial event.
    pub const PARTIAL: &str = "partial";
    /// `"answer" | "reasoning"` — which stream a partial chunk belongs to.
    pub const CHANNEL: &str = "channel";
    /// `"compaction" | "lifecycle"` — event class.
    pub const KIND: &str = "kind";
    /// [`super::Lifecycle`] payload.
    pub const LIFECYCLE: &str = "lifecycle";
    /// Forward-compatibility marker, currently always `"v1"`.
    pub const CONTRACT_VERSION: &str = "contract_version";

    pub const KIND_COMPACTION: &str = "compaction";
    pub const KIND_LIFECYCLE: &str = "lifecycle";
    pub const CHANNEL_ANSWER: &str = "answer";
    pub const CHANNEL_REASONING: &str = "reasoning";
    pub const CONTRACT_V1: &str = "v1";
}

pub type EventMeta = Map<String, Value>;

/// Immutable record in the per-session append-only log. Events are never
/// edited or deleted; ordering is append position, `time` is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "SessionID")]
    pub session_id: String,

    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,

    #[serde(rename = "Message")]
    pub message: Message,

    #[serde(rename = "Meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<EventMeta>,
}

impl Event {
    pub fn new(session: &SessionId, message: Message) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            time: Utc::now(),
            message,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: EventMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    fn meta_value(&self, key: &str) -> Option<&Value> {
        self.meta.as_ref().and_then(|m| m.get(key))
    }

    pub fn is_partial(&self) -> bool {
        self.meta_value(meta::PARTIAL)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn kind(&self) -> Option<&str> {
        self.meta_value(meta::KIND).and_then(Value::as_str)
    }

    pub fn is_compaction(&self) -> bool {
        self.kind() == Some(meta::KIND_COMPACTION)
    }

    pub fn is_lifecycle(&self) -> bool {
        self.kind() == Some(meta::KIND_LIFECYCLE)
    }

    pub fn channel(&self) -> Option<&str> {
        self.meta_value(meta::CHANNEL).and_then(Value::as_str)
    }

    pub fn lifecycle(&self) -> Option<Lifecycle> {
        let value = self.meta_value(meta::LIFECYCLE)?.clone();
        serde_json::from_value(value).ok()
    }
}

/// Run lifecycle state recorded as `meta.lifecycle` on `kind=lifecycle`
/// events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub status: LifecycleStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<LifecyclePhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl Lifecycle {
    pub fn running() -> Self {
        Self {
            status: LifecycleStatus::Running,
            phase: Some(LifecyclePhase::Run),
            error: None,
            error_code: None,
        }
    }

    pub fn completed() -> Self {
        Self {
            status: LifecycleStatus::Completed,
            phase: None,
            error: None,
            error_code: None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: LifecycleStatus::Canceled,
            phase: None,
            error: None,
            error_code: None,
        }
    }

    pub fn waiting_approval(error: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self {
            status: LifecycleStatus::WaitingApproval,
            phase: None,
            error: Some(error.into()),
            error_code: Some(error_code.into()),
        }
    }

    pub fn failed(error: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self {
            status: LifecycleStatus::Failed,
            phase: None,
            error: Some(error.into()),
            error_code: Some(error_code.into()),
        }
    }

    pub fn into_meta(self) -> EventMeta {
        let mut map = EventMeta::new();
        map.insert(
            meta::KIND.to_string(),
            Value::String(meta::KIND_LIFECYCLE.to_string()),
        );
        map.insert(
            meta::CONTRACT_VERSION.to_string(),
            Value::String(meta::CONTRACT_V1.to_string()),
        );
        if let Ok(value) = serde_json::to_value(&self) {
            map.insert(meta::LIFECYCLE.to_string(), value);
        }
        map
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleStatus {
    Running,
    Completed,
    WaitingApproval,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecyclePhase {
    Run,
    Compact,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn session() -> SessionId {
        SessionId::new("sable", "local", "s1").unwrap()
    }

    #[test]
    fn partial_flag_reads_from_meta() {
        let mut meta = EventMeta::new();
        meta.insert(meta::PARTIAL.to_string(), Value::Bool(true));
        meta.insert(
            meta::CHANNEL.to_string(),
            Value::String(meta::CHANNEL_ANSWER.to_string()),
        );
        let event = Event::new(&session(), Message::assistant("He")).with_meta(meta);

        assert!(event.is_partial());
        assert_eq!(Some("answer"), event.channel());
    }

    #[test]
    fn lifecycle_round_trips_through_meta() {
        let event = Event::new(&session(), Message::system(""))
            .with_meta(Lifecycle::failed("boom", "ProviderHTTP").into_meta());

        assert!(event.is_lifecycle());
        let lifecycle = event.lifecycle().unwrap();
        assert_eq!(LifecycleStatus::Failed, lifecycle.status);
        assert_eq!(Some("ProviderHTTP".to_string()), lifecycle.error_code);
    }

    #[test]
    fn wire_field_names_are_stable() {
        let event = Event::new(&session(), Message::user("hi"));
        let value = serde_json::to_value(&event).unwrap();
        for key in ["ID", "SessionID", "Time", "Message"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }
}

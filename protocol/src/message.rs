use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use strum_macros::Display;

/// One conversation message. The wire encoding is internally tagged on
/// `Role`, matching the on-disk JSONL schema, e.g.
/// `{"Role":"assistant","Text":"hi","ToolCalls":[...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Role", rename_all = "lowercase")]
pub enum Message {
    System {
        #[serde(rename = "Text", default, skip_serializing_if = "String::is_empty")]
        text: String,
    },
    User {
        #[serde(rename = "Text", default, skip_serializing_if = "String::is_empty")]
        text: String,
    },
    Assistant {
        #[serde(rename = "Text", default, skip_serializing_if = "String::is_empty")]
        text: String,

        #[serde(rename = "Reasoning", default, skip_serializing_if = "String::is_empty")]
        reasoning: String,

        #[serde(rename = "ToolCalls", default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        #[serde(rename = "ToolResponse")]
        tool_response: ToolResponse,
    },
}

/// A single function invocation emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Args", default)]
    pub args: Map<String, Value>,

    /// Opaque per-call token some providers attach to a tool call; it must
    /// be echoed back verbatim on the next request to keep the tool loop
    /// valid for that provider.
    #[serde(
        rename = "ThoughtSignature",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub thought_signature: Option<String>,
}

/// The recorded result of exactly one preceding [`ToolCall`], matched by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Result", default)]
    pub result: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System { text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            text: text.into(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool(response: ToolResponse) -> Self {
        Self::Tool {
            tool_response: response,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::User { .. } => Role::User,
            Message::Assistant { .. } => Role::Assistant,
            Message::Tool { .. } => Role::Tool,
        }
    }

    /// Plain text payload, empty for tool messages.
    pub fn text(&self) -> &str {
        match self {
            Message::System { text } | Message::User { text } | Message::Assistant { text, .. } => {
                text
            }
            Message::Tool { .. } => "",
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn assistant_round_trips_with_tool_calls() {
        let message = Message::Assistant {
            text: "running it".to_string(),
            reasoning: String::new(),
            tool_calls: vec![ToolCall {
                id: "c1".to_string(),
                name: "BASH".to_string(),
                args: json!({"command": "ls"}).as_object().unwrap().clone(),
                thought_signature: Some("sig".to_string()),
            }],
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!("assistant", value["Role"]);
        assert_eq!("sig", value["ToolCalls"][0]["ThoughtSignature"]);

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(message, back);
    }

    #[test]
    fn empty_fields_are_omitted() {
        let value = serde_json::to_value(Message::assistant("hi")).unwrap();
        assert!(value.get("Reasoning").is_none());
        assert!(value.get("ToolCalls").is_none());
    }

    #[test]
    fn tool_message_carries_one_response() {
        let message = Message::tool(ToolResponse {
            id: "c9".to_string(),
            name: "READ".to_string(),
            result: Map::new(),
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!("tool", value["Role"]);
        assert_eq!("c9", value["ToolResponse"]["ID"]);
    }
}

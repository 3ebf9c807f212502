//! Streaming update objects sent to chat clients, one JSON object per line.

use serde::{Deserialize, Serialize};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssistantMessage {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl AssistantMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: "assistant".to_string(),
        }
    }
}

/// One streamed update. A chunk with a non-null `error` is the authoritative
/// failure signal for the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub assistant_message: Option<AssistantMessage>,
    /// Reserved for entity-grid routing; always null from the chat loop.
    pub detected_table_intent: Option<String>,
    pub error: Option<String>,
}

impl Chunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            assistant_message: Some(AssistantMessage::new(text)),
            detected_table_intent: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            assistant_message: None,
            detected_table_intent: None,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn text(&self) -> Option<&str> {
        self.assistant_message.as_ref().map(|m| m.content.as_str())
    }

    pub fn to_ndjson_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"assistantMessage":null,"detectedTableIntent":null,"error":"serialization failed"}"#
                .to_string()
        });
        line.push('\n');
        line
    }
}

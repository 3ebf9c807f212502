use serde::{Deserialize, Serialize};

/// One entry of the model-facing conversation for a single request.
///
/// The sequence is append-only for the lifetime of a request and is never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    ToolOutput {
        call_id: String,
        output: String,
    },
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Turn::System { .. } => "system",
            Turn::User { .. } => "user",
            Turn::Assistant { .. } | Turn::ToolCall { .. } => "assistant",
            Turn::ToolOutput { .. } => "tool",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_turns_speak_as_assistant() {
        let call = Turn::ToolCall {
            call_id: "c1".to_string(),
            name: "execute_sql".to_string(),
            arguments: "{}".to_string(),
        };
        assert_eq!(call.role(), "assistant");
        let output = Turn::ToolOutput {
            call_id: "c1".to_string(),
            output: "ok".to_string(),
        };
        assert_eq!(output.role(), "tool");
    }
}

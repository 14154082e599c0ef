use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The role of the participant that authored a [`SessionMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Prompt text sent into the session.
    User,
    /// Model output.
    Assistant,
    /// A system-level instruction.
    System,
    /// Output produced by a tool invocation.
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// One piece of content inside a session message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Reasoning / thinking content.
    Reasoning {
        /// The reasoning text.
        text: String,
    },
    /// A tool invocation requested by the model.
    ToolCall {
        /// Identifier pairing the call with its result.
        call_id: String,
        /// Tool name.
        tool: String,
        /// JSON arguments.
        input: serde_json::Value,
    },
    /// The output of a tool invocation.
    ToolResult {
        /// Identifier of the originating call.
        call_id: String,
        /// Tool name.
        tool: String,
        /// Textual output.
        output: String,
        /// Whether the tool reported an error.
        is_error: bool,
    },
}

/// A single message read back from a host session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Host-assigned message id, unique within the session.
    pub id: String,
    /// Author of the message.
    pub role: MessageRole,
    /// Ordered content parts.
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    /// When the host created the message.
    pub created_at: DateTime<Utc>,
}

impl SessionMessage {
    /// Creates an empty message with the given id and role, stamped now.
    pub fn new(id: impl Into<String>, role: MessageRole) -> Self {
        Self {
            id: id.into(),
            role,
            parts: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Creates an assistant message holding one text part.
    pub fn assistant_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, MessageRole::Assistant).with_part(MessagePart::Text { text: text.into() })
    }

    /// Creates a user message holding one text part.
    pub fn user_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, MessageRole::User).with_part(MessagePart::Text { text: text.into() })
    }

    /// Appends a part.
    pub fn with_part(mut self, part: MessagePart) -> Self {
        self.parts.push(part);
        self
    }

    /// Overrides the creation timestamp.
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Concatenated text parts, newline separated. Reasoning is excluded.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Names of the tools this message invoked, in order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            MessagePart::ToolCall { tool, .. } => Some(tool.as_str()),
            _ => None,
        })
    }

    /// Whether the model authored this message.
    pub fn is_assistant(&self) -> bool {
        self.role == MessageRole::Assistant
    }
}

//! Conversation and message model.
//!
//! A conversation is a sequence of messages; each message carries ordered
//! content parts. Tool calls and their results are parts of the assistant
//! message that produced them, so the whole transcript travels by value
//! through the step loop; no shared mutable state between steps.

use crate::error::StructuredError;
use crate::identifiers::{CapabilityName, ConversationId, MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who can see a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

/// A conversation between a user and the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub owner: UserId,
    pub visibility: Visibility,
    /// Placeholder title on first turn; may be upgraded asynchronously.
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a private conversation titled with a placeholder derived
    /// from the first prompt.
    pub fn begin(owner: UserId, prompt: &str) -> Self {
        Self {
            id: ConversationId::generate(),
            owner,
            visibility: Visibility::Private,
            title: placeholder_title(prompt),
            created_at: Utc::now(),
        }
    }
}

/// Truncate a prompt into a provisional conversation title.
pub fn placeholder_title(prompt: &str) -> String {
    const MAX_TITLE_CHARS: usize = 60;
    let trimmed = prompt.trim();
    if trimmed.chars().count() <= MAX_TITLE_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX_TITLE_CHARS).collect();
        format!("{}…", cut.trim_end())
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Outcome of one tool invocation, as it appears in the transcript.
///
/// A tool failure is content for the next step, never a fault: the model
/// sees the structured error and can react to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(Value),
    Error(StructuredError),
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error(_))
    }
}

/// One ordered content part of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: CapabilityName,
        input: Value,
    },
    ToolResult {
        id: String,
        name: CapabilityName,
        outcome: ToolOutcome,
    },
}

/// Token and latency accounting for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub completion_seconds: f64,
}

impl Usage {
    /// Accumulate another step's usage into this one.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.completion_seconds += other.completion_seconds;
    }
}

/// A persisted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    /// Present on assistant messages only.
    pub usage: Option<Usage>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build the user message that triggers a generation.
    pub fn user(conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            role: Role::User,
            parts: vec![MessagePart::Text { text: text.into() }],
            usage: None,
            created_at: Utc::now(),
        }
    }

    /// Build an assistant message from a finished generation.
    pub fn assistant(
        conversation_id: ConversationId,
        parts: Vec<MessagePart>,
        usage: Usage,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            role: Role::Assistant,
            parts,
            usage: Some(usage),
            created_at: Utc::now(),
        }
    }

    /// Concatenated text content of this message.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}

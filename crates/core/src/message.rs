//! Conversation messages
//!
//! Messages are appended to a session's log in strict temporal order and
//! never mutated. Metadata is a small bag of typed keys recording how the
//! pipeline handled the exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A candidate the fallback chain skipped, and why
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedCandidate {
    /// Dotted intent label
    pub label: String,
    /// Skip reason: `ok-empty`, `tool-timeout`, `tool-server-unavailable`, ...
    pub reason: String,
}

/// Typed metadata recorded on a message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Intent label the pipeline ultimately used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Classifier confidence for the used candidate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Whether the multi-step agent handled this exchange
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub agent_used: bool,
    /// Agent step count, when the agent ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_steps: Option<u32>,
    /// Tools the pipeline attempted, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<String>,
    /// Candidates skipped before one succeeded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedCandidate>,
}

impl MessageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intent(mut self, label: impl Into<String>, confidence: f32) -> Self {
        self.intent = Some(label.into());
        self.confidence = Some(confidence);
        self
    }

    pub fn with_agent(mut self, steps: u32) -> Self {
        self.agent_used = true;
        self.agent_steps = Some(steps);
        self
    }

    pub fn record_skip(&mut self, label: impl Into<String>, reason: impl Into<String>) {
        self.skipped.push(SkippedCandidate {
            label: label.into(),
            reason: reason.into(),
        });
    }
}

/// A single message in a session's conversation log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Role of the speaker
    pub role: Role,
    /// Text content
    pub content: String,
    /// When the message was appended
    pub timestamp: DateTime<Utc>,
    /// Pipeline metadata
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: MessageMetadata::default(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

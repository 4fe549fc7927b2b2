//! Language model interface
//!
//! Two operations plus embeddings: `chat_stream` yields tokens through a
//! channel as they are produced; `generate` is a one-shot completion. The
//! options select a model variant per pipeline role so a deployment can run
//! a small classifier model next to a larger chat model.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Role of a chat message sent to the LM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// One message in an LM chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// Which pipeline role is calling; selects the model variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmRole {
    Classifier,
    Agent,
    Chat,
    Embedding,
}

/// Per-call options
#[derive(Debug, Clone)]
pub struct LlmOptions {
    pub role: LlmRole,
    /// Overrides the role's configured model when set
    pub model_override: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
    /// Per-LM-call deadline
    pub deadline: Option<Duration>,
}

impl LlmOptions {
    pub fn for_role(role: LlmRole) -> Self {
        Self {
            role,
            model_override: None,
            max_tokens: 512,
            temperature: 0.7,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }
}

/// Language model backend
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Stream chat tokens into `tx` as they are produced.
    ///
    /// Returns once the stream is complete or the receiver is dropped
    /// (cancellation). Dropping the receiver is not an error.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &LlmOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<String>;

    /// One-shot completion for a raw prompt.
    async fn generate(&self, prompt: &str, options: &LlmOptions) -> Result<String>;

    /// Embed text into the fixed-dimension vector space.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Whether the backend is reachable.
    async fn is_available(&self) -> bool;

    /// Model name used for a role, for logging.
    fn model_for(&self, role: LlmRole) -> String;
}

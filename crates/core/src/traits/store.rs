//! Conversation and feedback store interfaces

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::ConversationMessage;

/// Aggregate store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub sessions: usize,
    pub messages: usize,
}

/// Append-only per-session conversation log.
///
/// Guarantees: a `load_tail` after a successful `append` returns the appended
/// message; appends to one session are serialized so timestamps are monotonic
/// per session. No cross-session ordering.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(&self, session: &str, message: ConversationMessage) -> Result<()>;

    /// Last `n` messages in chronological order.
    async fn load_tail(&self, session: &str, n: usize) -> Result<Vec<ConversationMessage>>;

    async fn delete(&self, session: &str) -> Result<()>;

    /// Full-text search over message content; returns (session, message) pairs.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, ConversationMessage)>>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Which pipeline decision a correction applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackScope {
    IntentClassification,
    AgentToolChoice,
    ComplexityRouting,
}

impl FeedbackScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackScope::IntentClassification => "intent-classification",
            FeedbackScope::AgentToolChoice => "agent-tool-choice",
            FeedbackScope::ComplexityRouting => "complexity-routing",
        }
    }
}

/// A semantic correction: "for queries like this, the right label was X"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub scope: FeedbackScope,
    pub query: String,
    /// Fixed-dimension embedding of the query, from the external embedder
    pub embedding: Vec<f32>,
    pub wrong_label: String,
    pub right_label: String,
    pub created_at: DateTime<Utc>,
}

impl Correction {
    pub fn new(
        scope: FeedbackScope,
        query: impl Into<String>,
        embedding: Vec<f32>,
        wrong_label: impl Into<String>,
        right_label: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            query: query.into(),
            embedding,
            wrong_label: wrong_label.into(),
            right_label: right_label.into(),
            created_at: Utc::now(),
        }
    }
}

/// Correction storage with nearest-neighbour retrieval.
///
/// The core interacts only through this surface; backends other than vector
/// stores can implement it.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Idempotent on (scope, query, wrong, right): saving the same correction
    /// twice does not double-weight future few-shots.
    async fn save(&self, correction: Correction) -> Result<()>;

    async fn count(&self, scope: FeedbackScope) -> Result<usize>;

    /// Corrections in `scope` whose embedding is within `threshold` cosine
    /// similarity of `query`, best first, at most `limit`.
    async fn find_similar(
        &self,
        query: &[f32],
        scope: FeedbackScope,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<Correction>>;
}

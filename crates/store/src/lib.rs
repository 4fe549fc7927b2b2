//! Store adapters
//!
//! In-memory implementations of the conversation and feedback store traits.
//! These are the reference adapters; deployments with durable backends
//! implement the same traits outside this workspace.

pub mod conversation;
pub mod feedback;

pub use conversation::MemoryConversationStore;
pub use feedback::{CountCache, MemoryFeedbackStore, cosine_similarity};

use thiserror::Error;

/// Store adapter errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Embedding dimension mismatch: {0} vs {1}")]
    DimensionMismatch(usize, usize),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for hearth_core::Error {
    fn from(err: StoreError) -> Self {
        hearth_core::Error::Store(err.to_string())
    }
}

//! Crate-spanning error type
//!
//! Each crate in the workspace defines its own error enum; this is the
//! lowest common denominator they convert into at crate seams.

use thiserror::Error;

/// Core errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(String),

    #[error("LM error: {0}")]
    Llm(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Speech error: {0}")]
    Speech(String),

    #[error("Media player error: {0}")]
    Media(String),

    #[error("Invalid intent label: {0}")]
    InvalidLabel(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias using the core error
pub type Result<T> = std::result::Result<T, Error>;

//! Language model backend
//!
//! Implements the [`hearth_core::LanguageModel`] trait against an
//! Ollama-compatible HTTP endpoint:
//! - streaming chat over a token channel
//! - one-shot generation with retry on transient failures
//! - embeddings
//! - per-role model selection (classifier vs agent vs chat vs embedding)

pub mod backend;

pub use backend::{LlmBackendConfig, OllamaBackend};

use thiserror::Error;

/// LM errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<LlmError> for hearth_core::Error {
    fn from(err: LlmError) -> Self {
        hearth_core::Error::Llm(err.to_string())
    }
}

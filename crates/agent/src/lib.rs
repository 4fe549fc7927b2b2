//! Action execution and the multi-step agent loop
//!
//! The executor runs exactly one intent candidate against the tool registry
//! or a local handler; the agent loop interleaves LM reasoning with tool
//! calls under step and wall-clock budgets, emitting typed events so the
//! UI can render progress.

pub mod agent;
pub mod events;
pub mod executor;

pub use agent::{AgentLoop, AgentLoopConfig, AgentRunResult};
pub use events::{AgentEvent, AgentEventKind};
pub use executor::{ActionExecutor, ExecutionError, ExecutionOutcome};

use thiserror::Error;

/// Agent loop errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LM call failed: {0}")]
    Llm(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<AgentError> for hearth_core::Error {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Cancelled => hearth_core::Error::Cancelled,
            other => hearth_core::Error::Internal(other.to_string()),
        }
    }
}

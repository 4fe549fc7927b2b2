//! Tool registry and server transports
//!
//! Presents a coherent, frequently refreshed view of all callable external
//! tools. Each configured server is reached over one of three transports
//! (local subprocess, SSE, chunked HTTP stream); a background task per
//! server refreshes its tool list on the declared interval, and readers see
//! an atomically swapped snapshot.

pub mod descriptor;
pub mod registry;
pub mod transport;

pub use descriptor::{ParamSpec, ToolDescriptor};
pub use registry::{Snapshot, ToolRegistry};
pub use transport::{
    HttpStreamTransport, RemoteToolSpec, ServerTransport, SseTransport, StdioTransport,
};

use thiserror::Error;

/// Tool invocation failures, classified for the fallback chain
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,
}

impl InvokeError {
    /// Stable kind string, used in logs and message metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            InvokeError::UnknownTool(_) => "tool-unknown",
            InvokeError::InvalidParams(_) => "tool-invalid-params",
            InvokeError::ServerUnavailable(_) => "tool-server-unavailable",
            InvokeError::ServerError(_) => "tool-server-error",
            InvokeError::Timeout => "tool-timeout",
            InvokeError::Cancelled => "tool-cancelled",
        }
    }

    /// Transient errors let the fallback chain move on to the next
    /// candidate; permanent ones are skipped too but logged louder.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InvokeError::ServerUnavailable(_) | InvokeError::ServerError(_) | InvokeError::Timeout
        )
    }
}

impl From<InvokeError> for hearth_core::Error {
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::Cancelled => hearth_core::Error::Cancelled,
            other => hearth_core::Error::Tool(other.to_string()),
        }
    }
}

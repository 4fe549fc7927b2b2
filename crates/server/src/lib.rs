//! The session router
//!
//! Owns every live connection: registration and room binding, heartbeats,
//! rate limiting, the per-connection pipeline state machine, and the
//! orchestration that turns one client message into a streamed reply plus
//! optional audio routed into the room.

pub mod collaborators;
pub mod connection;
pub mod devices;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod rate_limit;
pub mod state;
pub mod ws;

pub use connection::{Connection, ConnectionRegistry, PipelineState};
pub use http::create_router;
pub use pipeline::{Pipeline, PipelineDeps};
pub use protocol::{ClientMessage, ServerMessage};
pub use rate_limit::TokenBucket;
pub use state::AppState;

use thiserror::Error;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Invalid state transition: {0} -> {1}")]
    InvalidTransition(PipelineState, PipelineState),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ServerError> for axum::http::StatusCode {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Registration(_) => axum::http::StatusCode::BAD_REQUEST,
            ServerError::InvalidTransition(_, _) => axum::http::StatusCode::CONFLICT,
            ServerError::RateLimit => axum::http::StatusCode::TOO_MANY_REQUESTS,
            ServerError::InvalidRequest(_) => axum::http::StatusCode::BAD_REQUEST,
            ServerError::ConnectionClosed => axum::http::StatusCode::GONE,
            ServerError::Internal(_) => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

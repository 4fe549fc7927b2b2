//! Configuration management for the assistant hub
//!
//! Supports loading configuration from:
//! - YAML/TOML files
//! - Environment variables (HEARTH_ prefix, `__` separator)
//! - Built-in defaults
//!
//! The tool-server declaration document is separate (`servers` module); the
//! tool registry is its sole consumer.

pub mod servers;
pub mod settings;

pub use servers::{EnabledFlag, ServerTransportKind, ToolServerDocument, ToolServerEntry};
pub use settings::{
    AgentSettings, ConnectionSettings, FeedbackSettings, LlmSettings, OutputSettings,
    ServerConfig, SessionSettings, Settings, ToolsSettings, load_settings,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Environment error: {0}")]
    Environment(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

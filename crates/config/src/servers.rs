//! Tool-server declaration document
//!
//! A static YAML document per deployment lists the external tool servers.
//! The tool registry is the only consumer. Entries are ordered; order is
//! preserved into prompt composition.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// How a tool server is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerTransportKind {
    /// Long-lived local subprocess, framed JSON over stdin/stdout
    Stdio,
    /// Server-sent events with request-correlated replies
    Sse,
    /// Bidirectional framed HTTP streaming
    HttpStream,
}

/// Enablement toggle: a literal boolean or an `${ENV_VAR}` reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnabledFlag {
    Literal(bool),
    EnvRef(String),
}

impl Default for EnabledFlag {
    fn default() -> Self {
        EnabledFlag::Literal(true)
    }
}

impl EnabledFlag {
    /// Resolve against the process environment.
    ///
    /// `${VAR}` is enabled when VAR is set to anything but `0`, `false` or
    /// the empty string. A bare string that is not an env reference is a
    /// document error.
    pub fn resolve(&self) -> Result<bool, ConfigError> {
        match self {
            EnabledFlag::Literal(b) => Ok(*b),
            EnabledFlag::EnvRef(s) => {
                let var = s
                    .strip_prefix("${")
                    .and_then(|s| s.strip_suffix('}'))
                    .ok_or_else(|| ConfigError::InvalidValue {
                        field: "enabled".to_string(),
                        message: format!("expected a boolean or ${{ENV_VAR}}, got {s:?}"),
                    })?;
                match std::env::var(var) {
                    Ok(v) => Ok(!matches!(v.as_str(), "" | "0" | "false")),
                    Err(_) => Ok(false),
                }
            }
        }
    }
}

fn default_refresh_interval() -> u64 {
    60
}

/// One tool server declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerEntry {
    pub name: String,
    pub transport: ServerTransportKind,
    /// Endpoint URL for sse / http_stream transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Command line for the stdio transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default)]
    pub enabled: EnabledFlag,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
    /// When present, restricts which of this server's tools appear in
    /// classifier prompts; all tools remain executable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tools: Option<Vec<String>>,
    /// Fully qualified tool name used to illustrate this server in prompts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_intent: Option<String>,
    /// Per-language arrays of user-phrased sample queries
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub examples: HashMap<String, Vec<String>>,
}

impl ToolServerEntry {
    /// Whether a tool of this server belongs in classifier prompts.
    pub fn include_in_prompt(&self, tool: &str) -> bool {
        match &self.prompt_tools {
            Some(allow) => allow.iter().any(|t| t == tool),
            None => true,
        }
    }

    /// Validate transport-specific required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.transport {
            ServerTransportKind::Stdio if self.command.is_none() => {
                Err(ConfigError::InvalidValue {
                    field: format!("servers.{}.command", self.name),
                    message: "stdio transport requires a command".to_string(),
                })
            }
            ServerTransportKind::Sse | ServerTransportKind::HttpStream
                if self.url.is_none() =>
            {
                Err(ConfigError::InvalidValue {
                    field: format!("servers.{}.url", self.name),
                    message: "network transports require a url".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// The full declaration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolServerDocument {
    #[serde(default)]
    pub servers: Vec<ToolServerEntry>,
}

impl ToolServerDocument {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let doc: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        for entry in &doc.servers {
            entry.validate()?;
        }
        Ok(doc)
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.to_string()))?;
        Self::from_yaml(&yaml)
    }

    /// Entries whose enablement resolves to true, in document order.
    pub fn enabled_servers(&self) -> Vec<&ToolServerEntry> {
        self.servers
            .iter()
            .filter(|s| s.enabled.resolve().unwrap_or(false))
            .collect()
    }
}

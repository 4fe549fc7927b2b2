//! Runtime settings
//!
//! Consumed by the core at startup and on explicit reload.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// HTTP/WebSocket server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Emit logs as JSON lines instead of human-readable text
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8170,
            cors_enabled: true,
            cors_origins: vec![],
            log_json: false,
        }
    }
}

/// Agent loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Master switch; when off, every query routes as simple
    pub enabled: bool,
    pub max_steps: u32,
    pub step_timeout_seconds: u64,
    pub total_timeout_seconds: u64,
    /// Model variant for agent steps, when different from the chat model
    pub model_override: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_steps: 8,
            step_timeout_seconds: 30,
            total_timeout_seconds: 120,
            model_override: None,
        }
    }
}

/// Tool server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSettings {
    /// Master switch for all tool servers
    pub enabled: bool,
    /// Path to the tool-server declaration document
    pub servers_file: String,
    /// Default per-tool-call deadline
    pub call_timeout_seconds: u64,
}

impl Default for ToolsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            servers_file: "servers.yaml".to_string(),
            call_timeout_seconds: 15,
        }
    }
}

/// Feedback few-shot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSettings {
    /// Minimum cosine similarity for a correction to count as a few-shot
    pub match_threshold: f32,
    /// At most this many few-shot examples per prompt
    pub fewshot_max: usize,
    /// TTL of the per-scope count cache
    pub count_cache_ttl_seconds: u64,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            match_threshold: 0.75,
            fewshot_max: 4,
            count_cache_ttl_seconds: 60,
        }
    }
}

/// Output routing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Host advertised in media URLs handed to external players
    pub advertise_host: String,
    pub advertise_port: u16,
    /// When both an external sink and the input device can play, prefer the
    /// external sink
    pub prefer_external_sink: bool,
    /// Seconds a cached audio artifact stays fetchable
    pub audio_cache_ttl_seconds: u64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            advertise_host: "127.0.0.1".to_string(),
            advertise_port: 8170,
            prefer_external_sink: true,
            audio_cache_ttl_seconds: 120,
        }
    }
}

/// Session tail sizes per endpoint kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub tail_size_chat: usize,
    pub tail_size_ws: usize,
    pub tail_size_satellite: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tail_size_chat: 20,
            tail_size_ws: 10,
            tail_size_satellite: 6,
        }
    }
}

/// Per-connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_grace_seconds: u64,
    /// Sustained inbound messages per second
    pub rate_limit_per_connection: u32,
    /// Token bucket burst size
    pub rate_limit_burst: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 30,
            heartbeat_grace_seconds: 90,
            rate_limit_per_connection: 10,
            rate_limit_burst: 20,
        }
    }
}

/// LM backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub endpoint: String,
    pub chat_model: String,
    pub classifier_model: String,
    pub embedding_model: String,
    /// Per-LM-call deadline
    pub call_timeout_seconds: u64,
    /// Total-per-utterance deadline
    pub utterance_timeout_seconds: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            chat_model: "qwen2.5:7b-instruct-q4_K_M".to_string(),
            classifier_model: "qwen2.5:1.5b-instruct".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            call_timeout_seconds: 30,
            utterance_timeout_seconds: 180,
        }
    }
}

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub agent: AgentSettings,
    pub tools: ToolsSettings,
    pub feedback: FeedbackSettings,
    pub output: OutputSettings,
    pub session: SessionSettings,
    pub connection: ConnectionSettings,
    pub llm: LlmSettings,
}

impl Settings {
    /// Sanity-check cross-field constraints.
    ///
    /// The utterance deadline must cover the agent's worst case, otherwise
    /// the outer timeout always trips first and the agent can never finish.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let agent_worst_case = self.agent.max_steps as u64 * self.agent.step_timeout_seconds;
        if self.agent.enabled && self.agent.total_timeout_seconds > agent_worst_case {
            tracing::warn!(
                total = self.agent.total_timeout_seconds,
                worst_case = agent_worst_case,
                "agent total timeout exceeds max_steps * step_timeout; steps will never use it"
            );
        }
        if self.llm.utterance_timeout_seconds < self.agent.total_timeout_seconds {
            return Err(ConfigError::InvalidValue {
                field: "llm.utterance_timeout_seconds".to_string(),
                message: format!(
                    "must be >= agent.total_timeout_seconds ({})",
                    self.agent.total_timeout_seconds
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.feedback.match_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "feedback.match_threshold".to_string(),
                message: "must be within [0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

/// Load settings: defaults, then an optional file, then environment.
pub fn load_settings(path: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(config::Config::try_from(&Settings::default())?);

    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path));
    }

    let cfg = builder
        .add_source(config::Environment::with_prefix("HEARTH").separator("__"))
        .build()?;

    let settings: Settings = cfg.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.agent.max_steps, 8);
        assert!((settings.feedback.match_threshold - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn test_load_defaults_without_file() {
        let settings = load_settings(None).unwrap();
        assert_eq!(settings.server.port, 8170);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            "agent:\n  max_steps: 3\nsession:\n  tail_size_satellite: 4\n"
        )
        .unwrap();

        let settings = load_settings(file.path().to_str()).unwrap();
        assert_eq!(settings.agent.max_steps, 3);
        assert_eq!(settings.session.tail_size_satellite, 4);
        // untouched sections keep defaults
        assert_eq!(settings.connection.heartbeat_interval_seconds, 30);
    }

    #[test]
    fn test_validate_rejects_short_utterance_deadline() {
        let mut settings = Settings::default();
        settings.llm.utterance_timeout_seconds = 10;
        assert!(settings.validate().is_err());
    }
}

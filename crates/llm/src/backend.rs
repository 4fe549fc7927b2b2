//! Ollama-compatible backend

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use hearth_core::{ChatMessage, LanguageModel, LlmOptions, LlmRole, Result};

use crate::LlmError;

/// Backend configuration
#[derive(Debug, Clone)]
pub struct LlmBackendConfig {
    pub endpoint: String,
    pub chat_model: String,
    pub classifier_model: String,
    pub embedding_model: String,
    /// Agent steps use the chat model unless overridden
    pub agent_model: Option<String>,
    /// Connection-level timeout; per-call deadlines come in via options
    pub timeout: Duration,
    /// Retries for transient failures on one-shot generation
    pub max_retries: u32,
    /// Initial backoff, doubled per retry
    pub initial_backoff: Duration,
}

impl Default for LlmBackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            chat_model: "qwen2.5:7b-instruct-q4_K_M".to_string(),
            classifier_model: "qwen2.5:1.5b-instruct".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            agent_model: None,
            timeout: Duration::from_secs(60),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Ollama backend
#[derive(Clone)]
pub struct OllamaBackend {
    client: Client,
    config: LlmBackendConfig,
}

impl OllamaBackend {
    pub fn new(config: LlmBackendConfig) -> std::result::Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{}", self.config.endpoint, path)
    }

    fn model_name(&self, options: &LlmOptions) -> String {
        options
            .model_override
            .clone()
            .unwrap_or_else(|| self.model_for(options.role))
    }

    fn is_retryable(error: &LlmError) -> bool {
        matches!(error, LlmError::Network(_) | LlmError::Timeout)
    }

    async fn execute_generate(
        &self,
        request: &GenerateRequest,
        deadline: Option<Duration>,
    ) -> std::result::Result<String, LlmError> {
        let mut builder = self.client.post(self.api_url("/generate")).json(request);
        if let Some(deadline) = deadline {
            builder = builder.timeout(deadline);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(LlmError::Network(format!("server error {status}: {body}")));
            }
            return Err(LlmError::Api(body));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(parsed.response)
    }
}

#[async_trait]
impl LanguageModel for OllamaBackend {
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &LlmOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        let request = ChatRequest {
            model: self.model_name(options),
            messages: messages.iter().map(WireMessage::from).collect(),
            stream: true,
            options: Some(WireOptions {
                temperature: Some(options.temperature),
                num_predict: Some(options.max_tokens as i32),
            }),
        };

        let mut builder = self.client.post(self.api_url("/chat")).json(&request);
        if let Some(deadline) = options.deadline {
            builder = builder.timeout(deadline);
        }
        let response = builder.send().await.map_err(LlmError::from)?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(body).into());
        }

        let mut full = String::new();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(LlmError::from)?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // NDJSON: one chunk object per line
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                let parsed: ChatStreamChunk = match serde_json::from_str(&line) {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let token = parsed.message.content;
                full.push_str(&token);

                if !token.is_empty() && tx.send(token).await.is_err() {
                    // receiver dropped: cancelled downstream, not an error
                    tracing::debug!("chat stream receiver dropped; stopping generation");
                    break 'outer;
                }
                if parsed.done {
                    break 'outer;
                }
            }
        }

        Ok(full)
    }

    async fn generate(&self, prompt: &str, options: &LlmOptions) -> Result<String> {
        let request = GenerateRequest {
            model: self.model_name(options),
            prompt: prompt.to_string(),
            stream: false,
            options: Some(WireOptions {
                temperature: Some(options.temperature),
                num_predict: Some(options.max_tokens as i32),
            }),
        };

        let mut last_error = None;
        let mut backoff = self.config.initial_backoff;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tracing::warn!(
                    attempt,
                    max = self.config.max_retries,
                    "LM request failed, retrying in {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self.execute_generate(&request, options.deadline).await {
                Ok(text) => return Ok(text),
                Err(e) if Self::is_retryable(&e) => last_error = Some(e),
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error
            .unwrap_or_else(|| LlmError::Network("max retries exceeded".to_string()))
            .into())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbedRequest {
            model: self.config.embedding_model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(self.api_url("/embeddings"))
            .json(&request)
            .send()
            .await
            .map_err(LlmError::from)?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(body).into());
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(parsed.embedding)
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.config.endpoint))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn model_for(&self, role: LlmRole) -> String {
        match role {
            LlmRole::Classifier => self.config.classifier_model.clone(),
            LlmRole::Agent => self
                .config
                .agent_model
                .clone()
                .unwrap_or_else(|| self.config.chat_model.clone()),
            LlmRole::Chat => self.config.chat_model.clone(),
            LlmRole::Embedding => self.config.embedding_model.clone(),
        }
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireOptions>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    message: WireMessage,
    done: bool,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireOptions>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

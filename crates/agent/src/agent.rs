//! The multi-step agent loop
//!
//! One instance per invocation. The transcript of (reasoning, tool, params,
//! result) tuples is owned by the loop and handed to the LM as text each
//! step; no cross-task locking on the hot path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hearth_core::{
    ConversationMessage, FeedbackScope, FeedbackStore, LanguageModel, LlmOptions, LlmRole,
    PermissionPredicate,
};
use hearth_store::CountCache;
use hearth_tools::ToolRegistry;

use crate::events::{AgentEvent, AgentEventKind};
use crate::AgentError;

const CANNED_FAILURE: &str = "I couldn't complete that in time.";

/// Per-deployment agent budgets
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub max_steps: u32,
    pub step_timeout: Duration,
    pub total_timeout: Duration,
    pub model_override: Option<String>,
    pub match_threshold: f32,
    pub fewshot_max: usize,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 8,
            step_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(120),
            model_override: None,
            match_threshold: 0.75,
            fewshot_max: 4,
        }
    }
}

/// What one run produced
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub answer: String,
    pub steps: u32,
    /// The run hit max_steps or the total deadline before a natural answer
    pub budget_exhausted: bool,
}

struct TranscriptEntry {
    reason: String,
    tool: String,
    params: serde_json::Value,
    result: String,
}

/// The reason-act loop
pub struct AgentLoop {
    llm: Arc<dyn LanguageModel>,
    registry: Arc<ToolRegistry>,
    feedback: Arc<dyn FeedbackStore>,
    counts: Arc<CountCache>,
    config: AgentLoopConfig,
}

impl AgentLoop {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        registry: Arc<ToolRegistry>,
        feedback: Arc<dyn FeedbackStore>,
        counts: Arc<CountCache>,
        config: AgentLoopConfig,
    ) -> Self {
        Self { llm, registry, feedback, counts, config }
    }

    /// Run the loop for one query.
    ///
    /// Events go to `events`; the final answer is pushed through `tokens`.
    /// Budget exhaustion synthesizes a closing answer (or the canned
    /// failure line); it never drops the reply silently.
    pub async fn run(
        &self,
        session_id: &str,
        query: &str,
        tail: &[ConversationMessage],
        permission: &PermissionPredicate,
        events: mpsc::Sender<AgentEvent>,
        tokens: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<AgentRunResult, AgentError> {
        let started = Instant::now();
        let catalog = self.build_catalog(query).await;
        let mut transcript: Vec<TranscriptEntry> = Vec::new();
        let mut step: u32 = 0;
        let mut parse_retry_used = false;

        while step < self.config.max_steps && started.elapsed() < self.config.total_timeout {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let remaining = self.config.total_timeout.saturating_sub(started.elapsed());
            let deadline = self.config.step_timeout.min(remaining);
            let prompt = self.step_prompt(query, tail, &catalog, &transcript);

            let reply = match self.llm_step(&prompt, deadline, cancel).await {
                Ok(reply) => reply,
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    tracing::warn!(error = %e, step, "agent step LM call failed");
                    break;
                }
            };

            match parse_step(&reply) {
                Some(StepDirective::Final { answer }) => {
                    let steps = step;
                    send_answer(&tokens, &answer).await;
                    tracing::debug!(session_id, steps, "agent produced final answer");
                    return Ok(AgentRunResult { answer, steps, budget_exhausted: false });
                }
                Some(StepDirective::Tool { tool, params, reason }) => {
                    let _ = events
                        .send(AgentEvent::new(
                            session_id,
                            step,
                            AgentEventKind::ToolCall {
                                name: tool.clone(),
                                params: params.clone(),
                                reason: reason.clone(),
                            },
                        ))
                        .await;

                    let result = if permission(&tool) {
                        let remaining =
                            self.config.total_timeout.saturating_sub(started.elapsed());
                        self.registry
                            .invoke_cancellable(
                                &tool,
                                &params,
                                Some(self.config.step_timeout.min(remaining)),
                                cancel,
                            )
                            .await
                    } else {
                        Err(hearth_tools::InvokeError::ServerError(
                            "not permitted for this user".to_string(),
                        ))
                    };

                    let (success, rendered) = match &result {
                        Ok(value) => (true, value.to_string()),
                        Err(hearth_tools::InvokeError::Cancelled) => {
                            return Err(AgentError::Cancelled)
                        }
                        Err(e) => (false, format!("error: {e}")),
                    };

                    let _ = events
                        .send(AgentEvent::new(
                            session_id,
                            step,
                            AgentEventKind::ToolResult {
                                name: tool.clone(),
                                success,
                                result: result.unwrap_or(serde_json::Value::Null),
                            },
                        ))
                        .await;

                    transcript.push(TranscriptEntry { reason, tool, params, result: rendered });
                    step += 1;
                }
                None => {
                    let _ = events
                        .send(AgentEvent::new(
                            session_id,
                            step,
                            AgentEventKind::Thinking {
                                note: Some("reply was not parseable; retrying".to_string()),
                            },
                        ))
                        .await;
                    if parse_retry_used {
                        tracing::warn!(step, "second unparseable agent step; synthesizing");
                        break;
                    }
                    parse_retry_used = true;
                }
            }
        }

        // Budget exhausted (or the model stopped cooperating): one last LM
        // call with the transcript and an instruction to conclude.
        let answer = self.synthesize_closing(query, &transcript, cancel).await;
        send_answer(&tokens, &answer).await;
        Ok(AgentRunResult { answer, steps: step, budget_exhausted: true })
    }

    async fn llm_step(
        &self,
        prompt: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let mut options = LlmOptions::for_role(LlmRole::Agent).with_deadline(deadline);
        if let Some(model) = &self.config.model_override {
            options = options.with_model(model.clone());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = self.llm.generate(prompt, &options) => {
                result.map_err(|e| AgentError::Llm(e.to_string()))
            }
        }
    }

    /// Tool catalog plus feedback annotations, built once per invocation.
    async fn build_catalog(&self, query: &str) -> String {
        let mut catalog = String::from("## Tools\n");
        for tool in self.registry.list_for_prompt() {
            catalog.push_str(&tool.prompt_line());
            catalog.push('\n');
        }

        let scope = FeedbackScope::AgentToolChoice;
        let has_corrections = matches!(
            self.counts.count(self.feedback.as_ref(), scope).await,
            Ok(n) if n > 0
        );
        if has_corrections {
            if let Ok(embedding) = self.llm.embed(query).await {
                let corrections = self
                    .feedback
                    .find_similar(&embedding, scope, self.config.match_threshold, self.config.fewshot_max)
                    .await
                    .unwrap_or_default();
                if !corrections.is_empty() {
                    catalog.push_str("\n## Tool choice corrections\n");
                    for c in corrections {
                        catalog.push_str(&format!(
                            "For queries like {:?}, use {} instead of {}.\n",
                            c.query, c.right_label, c.wrong_label
                        ));
                    }
                }
            }
        }
        catalog
    }

    fn step_prompt(
        &self,
        query: &str,
        tail: &[ConversationMessage],
        catalog: &str,
        transcript: &[TranscriptEntry],
    ) -> String {
        let mut prompt = String::from(
            "You answer household queries step by step, calling at most one \
             tool per step. Reply with exactly one JSON object: either \
             {\"action\": \"tool\", \"tool\": \"<name>\", \"params\": {...}, \
             \"reason\": \"...\"} to call a tool, or \
             {\"action\": \"final\", \"answer\": \"...\"} when you can answer.\n\n",
        );
        prompt.push_str(catalog);

        if !tail.is_empty() {
            prompt.push_str("\n## Conversation so far\n");
            for message in tail {
                prompt.push_str(&format!("{}: {}\n", message.role, message.content));
            }
        }

        prompt.push_str("\n## Query\n");
        prompt.push_str(query);

        if !transcript.is_empty() {
            prompt.push_str("\n\n## Steps taken\n");
            for (i, entry) in transcript.iter().enumerate() {
                prompt.push_str(&format!(
                    "{}. {} called {}({}) -> {}\n",
                    i + 1,
                    entry.reason,
                    entry.tool,
                    entry.params,
                    entry.result
                ));
            }
        }
        prompt
    }

    async fn synthesize_closing(
        &self,
        query: &str,
        transcript: &[TranscriptEntry],
        cancel: &CancellationToken,
    ) -> String {
        let mut prompt = format!(
            "The user asked: {query:?}. You ran out of steps. Conclude now: \
             give the best final answer you can from the results below, in \
             plain text.\n\n"
        );
        for entry in transcript {
            prompt.push_str(&format!("{}({}) -> {}\n", entry.tool, entry.params, entry.result));
        }

        match self.llm_step(&prompt, self.config.step_timeout, cancel).await {
            Ok(answer) if !answer.trim().is_empty() => answer,
            _ => CANNED_FAILURE.to_string(),
        }
    }
}

async fn send_answer(tokens: &mpsc::Sender<String>, answer: &str) {
    let _ = tokens.send(answer.to_string()).await;
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StepDirective {
    Tool {
        tool: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default)]
        reason: String,
    },
    Final {
        answer: String,
    },
}

/// Extract the first parseable step directive, tolerating surrounding prose.
fn parse_step(reply: &str) -> Option<StepDirective> {
    for (idx, ch) in reply.char_indices() {
        if ch != '{' {
            continue;
        }
        let mut iter =
            serde_json::Deserializer::from_str(&reply[idx..]).into_iter::<serde_json::Value>();
        if let Some(Ok(value)) = iter.next() {
            if let Ok(directive) = serde_json::from_value::<StepDirective>(value) {
                return Some(directive);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hearth_config::{EnabledFlag, ServerTransportKind, ToolServerEntry};
    use hearth_core::{allow_all, ChatMessage, Result};
    use hearth_store::MemoryFeedbackStore;
    use hearth_tools::{InvokeError, RemoteToolSpec, ServerTransport};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<&str>) -> Self {
            Self { replies: Mutex::new(replies.into_iter().rev().map(String::from).collect()) }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedLlm {
        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
            _options: &LlmOptions,
            _tx: mpsc::Sender<String>,
        ) -> Result<String> {
            Ok(String::new())
        }

        async fn generate(&self, _prompt: &str, _options: &LlmOptions) -> Result<String> {
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| hearth_core::Error::Llm("script exhausted".to_string()))
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn model_for(&self, _role: LlmRole) -> String {
            "scripted".to_string()
        }
    }

    struct EchoTransport;

    #[async_trait]
    impl ServerTransport for EchoTransport {
        async fn list_tools(&self) -> std::result::Result<Vec<RemoteToolSpec>, InvokeError> {
            Ok(vec![
                RemoteToolSpec {
                    name: "current".to_string(),
                    description: "Current weather".to_string(),
                    input_schema: json!({}),
                },
                RemoteToolSpec {
                    name: "search".to_string(),
                    description: "Search hotels".to_string(),
                    input_schema: json!({}),
                },
            ])
        }

        async fn invoke(
            &self,
            tool: &str,
            _params: &serde_json::Value,
            _deadline: Duration,
        ) -> std::result::Result<serde_json::Value, InvokeError> {
            Ok(json!({"tool": tool, "data": "result"}))
        }
    }

    async fn agent_loop(replies: Vec<&str>, config: AgentLoopConfig) -> AgentLoop {
        let mut registry = ToolRegistry::new(Duration::from_secs(5));
        registry.add_server(
            ToolServerEntry {
                name: "weather".to_string(),
                transport: ServerTransportKind::HttpStream,
                url: Some("http://localhost:1".to_string()),
                command: None,
                args: vec![],
                enabled: EnabledFlag::Literal(true),
                refresh_interval_seconds: 60,
                prompt_tools: None,
                example_intent: None,
                examples: HashMap::new(),
            },
            Arc::new(EchoTransport),
        );
        let registry = Arc::new(registry);
        registry.refresh_all().await;

        AgentLoop::new(
            Arc::new(ScriptedLlm::new(replies)),
            registry,
            Arc::new(MemoryFeedbackStore::new()),
            Arc::new(CountCache::new(Duration::from_secs(60))),
            config,
        )
    }

    async fn run_collecting(
        agent: &AgentLoop,
    ) -> (AgentRunResult, Vec<AgentEvent>, Vec<String>) {
        let (event_tx, mut event_rx) = mpsc::channel(32);
        let (token_tx, mut token_rx) = mpsc::channel(32);
        let result = agent
            .run(
                "s4",
                "What's the weather in Berlin and find me a hotel there under 150 euros?",
                &[],
                &allow_all(),
                event_tx,
                token_tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(e) = event_rx.try_recv() {
            events.push(e);
        }
        let mut tokens = Vec::new();
        while let Ok(t) = token_rx.try_recv() {
            tokens.push(t);
        }
        (result, events, tokens)
    }

    #[test]
    fn test_parse_step_variants() {
        let tool = parse_step(
            "Let me check the weather.\n\
             {\"action\": \"tool\", \"tool\": \"weather.current\", \
              \"params\": {\"city\": \"Berlin\"}, \"reason\": \"forecast first\"}",
        );
        assert!(matches!(tool, Some(StepDirective::Tool { .. })));

        let final_answer =
            parse_step("{\"action\": \"final\", \"answer\": \"It is sunny.\"}");
        match final_answer {
            Some(StepDirective::Final { answer }) => assert_eq!(answer, "It is sunny."),
            other => panic!("expected final, got {other:?}"),
        }

        assert!(parse_step("no structure at all").is_none());
    }

    #[tokio::test]
    async fn test_two_step_run() {
        let agent = agent_loop(
            vec![
                r#"{"action": "tool", "tool": "weather.current", "params": {"city": "Berlin"}, "reason": "weather first"}"#,
                r#"{"action": "tool", "tool": "weather.search", "params": {"city": "Berlin", "max": 150}, "reason": "now hotels"}"#,
                r#"{"action": "final", "answer": "Sunny, and Hotel Spree is 120 euros."}"#,
            ],
            AgentLoopConfig::default(),
        )
        .await;

        let (result, events, tokens) = run_collecting(&agent).await;

        assert!(!result.budget_exhausted);
        assert_eq!(result.steps, 2);
        let calls = events
            .iter()
            .filter(|e| matches!(e.kind, AgentEventKind::ToolCall { .. }))
            .count();
        let results = events
            .iter()
            .filter(|e| matches!(e.kind, AgentEventKind::ToolResult { .. }))
            .count();
        assert_eq!(calls, 2);
        assert_eq!(results, 2);
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].contains("Hotel Spree"));

        // step indices increase monotonically
        let steps: Vec<u32> = events.iter().map(|e| e.step).collect();
        assert!(steps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_synthesizes() {
        let mut config = AgentLoopConfig::default();
        config.max_steps = 1;
        let agent = agent_loop(
            vec![
                r#"{"action": "tool", "tool": "weather.current", "params": {}, "reason": "weather"}"#,
                "Berlin is sunny; I could not finish the hotel search.",
            ],
            config,
        )
        .await;

        let (result, events, tokens) = run_collecting(&agent).await;

        assert!(result.budget_exhausted);
        assert_eq!(result.steps, 1);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e.kind, AgentEventKind::ToolCall { .. }))
                .count(),
            1
        );
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].contains("sunny"));
    }

    #[tokio::test]
    async fn test_synthesis_failure_yields_canned_message() {
        let mut config = AgentLoopConfig::default();
        config.max_steps = 1;
        let agent = agent_loop(
            vec![r#"{"action": "tool", "tool": "weather.current", "params": {}, "reason": "r"}"#],
            config,
        )
        .await;

        let (result, _, tokens) = run_collecting(&agent).await;
        assert!(result.budget_exhausted);
        assert_eq!(tokens[0], CANNED_FAILURE);
    }

    #[tokio::test]
    async fn test_unparseable_step_retries_once_then_synthesizes() {
        let agent = agent_loop(
            vec![
                "utter nonsense",
                "more nonsense",
                "Nothing was accomplished.",
            ],
            AgentLoopConfig::default(),
        )
        .await;

        let (result, events, _) = run_collecting(&agent).await;
        assert!(result.budget_exhausted);
        assert_eq!(result.steps, 0);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e.kind, AgentEventKind::Thinking { .. }))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_cancellation() {
        let agent = agent_loop(
            vec![r#"{"action": "final", "answer": "unused"}"#],
            AgentLoopConfig::default(),
        )
        .await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (event_tx, _event_rx) = mpsc::channel(8);
        let (token_tx, _token_rx) = mpsc::channel(8);
        let err = agent
            .run("s1", "q", &[], &allow_all(), event_tx, token_tx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}

//! Pipeline orchestration
//!
//! The canonical single-shot flow for one utterance: load tail, append the
//! user message, route by complexity, run the classifier and the ranked
//! fallback chain (or the agent loop), stream the reply, append the
//! assistant message, then synthesize and route audio into the room.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hearth_agent::{ActionExecutor, AgentLoop, AgentLoopConfig, ExecutionOutcome};
use hearth_classifier::{
    Classification, ClassifierConfig, Complexity, ComplexityDetector, IntentClassifier,
};
use hearth_config::Settings;
use hearth_core::{
    ChatMessage, ConversationMessage, ConversationStore, FeedbackStore, IntentCandidate,
    LanguageModel, LlmOptions, LlmRole, MessageMetadata, RetrievalBundle, Retriever, Role,
    SpeechToText, TextToSpeech,
};
use hearth_output::{Delivery, InputDeviceRef, OutputRouter};
use hearth_store::CountCache;
use hearth_tools::ToolRegistry;

use crate::connection::{Connection, PipelineState};
use crate::devices::CachedDirectory;
use crate::metrics;
use crate::protocol::ServerMessage;

const DENIAL_LINE: &str = "I'm not allowed to do that for you.";
const TEMPORARY_FAILURE: &str = "I'm having trouble answering right now; please try again.";
const TIMED_OUT_LINE: &str = "I couldn't complete that in time.";

/// External collaborators and shared components the pipeline is built from
pub struct PipelineDeps {
    pub store: Arc<dyn ConversationStore>,
    pub feedback: Arc<dyn FeedbackStore>,
    pub counts: Arc<CountCache>,
    pub llm: Arc<dyn LanguageModel>,
    pub registry: Arc<ToolRegistry>,
    pub retriever: Arc<dyn Retriever>,
    pub tts: Option<Arc<dyn TextToSpeech>>,
    pub stt: Option<Arc<dyn SpeechToText>>,
    pub directory: Arc<CachedDirectory>,
    pub output: Arc<OutputRouter>,
}

struct ExchangeOutcome {
    answer: String,
    metadata: MessageMetadata,
    agent_steps: Option<u32>,
}

/// The dispatch pipeline
pub struct Pipeline {
    store: Arc<dyn ConversationStore>,
    llm: Arc<dyn LanguageModel>,
    registry: Arc<ToolRegistry>,
    tts: Option<Arc<dyn TextToSpeech>>,
    pub stt: Option<Arc<dyn SpeechToText>>,
    directory: Arc<CachedDirectory>,
    output: Arc<OutputRouter>,
    classifier: IntentClassifier,
    complexity: ComplexityDetector,
    executor: ActionExecutor,
    agent: AgentLoop,
    agent_enabled: bool,
    utterance_timeout: Duration,
    tool_deadline: Duration,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps, settings: &Settings) -> Self {
        let classifier = IntentClassifier::new(
            Arc::clone(&deps.llm),
            Arc::clone(&deps.feedback),
            Arc::clone(&deps.counts),
            ClassifierConfig {
                match_threshold: settings.feedback.match_threshold,
                fewshot_max: settings.feedback.fewshot_max,
                call_timeout: Duration::from_secs(settings.llm.call_timeout_seconds),
            },
        );
        let complexity = ComplexityDetector::new(
            Arc::clone(&deps.llm),
            Arc::clone(&deps.feedback),
            Arc::clone(&deps.counts),
            settings.feedback.match_threshold,
            settings.agent.enabled,
        );
        let executor = ActionExecutor::new(Arc::clone(&deps.registry), Arc::clone(&deps.retriever));
        let agent = AgentLoop::new(
            Arc::clone(&deps.llm),
            Arc::clone(&deps.registry),
            Arc::clone(&deps.feedback),
            Arc::clone(&deps.counts),
            AgentLoopConfig {
                max_steps: settings.agent.max_steps,
                step_timeout: Duration::from_secs(settings.agent.step_timeout_seconds),
                total_timeout: Duration::from_secs(settings.agent.total_timeout_seconds),
                model_override: settings.agent.model_override.clone(),
                match_threshold: settings.feedback.match_threshold,
                fewshot_max: settings.feedback.fewshot_max,
            },
        );

        Self {
            store: deps.store,
            llm: deps.llm,
            registry: deps.registry,
            tts: deps.tts,
            stt: deps.stt,
            directory: deps.directory,
            output: deps.output,
            classifier,
            complexity,
            executor,
            agent,
            agent_enabled: settings.agent.enabled,
            utterance_timeout: Duration::from_secs(settings.llm.utterance_timeout_seconds),
            tool_deadline: Duration::from_secs(settings.tools.call_timeout_seconds),
        }
    }

    /// Handle one text utterance end to end.
    ///
    /// Emits `action`/`stream`/agent frames and exactly one terminal `done`
    /// per reply; appends at most one assistant message. A cancelled
    /// exchange (transport close) appends nothing and emits nothing more.
    pub async fn handle_text(
        &self,
        conn: &Arc<Connection>,
        session_id: &str,
        text: &str,
        use_rag: bool,
        knowledge_base: Option<&str>,
        tail_size: usize,
    ) {
        let _ = conn.transition(PipelineState::Processing).await;
        let cancel = conn.cancel.child_token();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(session_id, "exchange cancelled; no assistant append");
                let _ = conn.transition(PipelineState::Closing).await;
                return;
            }
            result = tokio::time::timeout(
                self.utterance_timeout,
                self.exchange(conn, session_id, text, use_rag, knowledge_base, tail_size, &cancel),
            ) => match result {
                Ok(Some(outcome)) => outcome,
                Ok(None) => {
                    // cancelled mid-flight
                    let _ = conn.transition(PipelineState::Closing).await;
                    return;
                }
                Err(_) => {
                    cancel.cancel();
                    tracing::warn!(session_id, "utterance deadline tripped");
                    let _ = conn.send(ServerMessage::Stream { content: TIMED_OUT_LINE.to_string() }).await;
                    ExchangeOutcome {
                        answer: TIMED_OUT_LINE.to_string(),
                        metadata: MessageMetadata::new(),
                        agent_steps: None,
                    }
                }
            }
        };

        // one assistant message per user message
        let assistant = ConversationMessage::assistant(&outcome.answer)
            .with_metadata(outcome.metadata.clone());
        if let Err(e) = self.store.append(session_id, assistant).await {
            tracing::warn!(session_id, error = %e, "assistant append failed");
        }

        if conn.is_device() {
            let _ = conn
                .send(ServerMessage::ResponseText {
                    text: outcome.answer.clone(),
                    session_id: session_id.to_string(),
                })
                .await;
        }

        let tts_handled = self.route_audio(conn, session_id, &outcome.answer).await;
        let _ = conn
            .send(ServerMessage::Done { tts_handled, agent_steps: outcome.agent_steps })
            .await;
        let _ = conn.transition(PipelineState::Idle).await;
    }

    /// Everything up to (but not including) the assistant append and audio
    /// routing. `None` means the exchange was cancelled.
    async fn exchange(
        &self,
        conn: &Arc<Connection>,
        session_id: &str,
        text: &str,
        use_rag: bool,
        knowledge_base: Option<&str>,
        tail_size: usize,
        cancel: &CancellationToken,
    ) -> Option<ExchangeOutcome> {
        // store-unavailable: classifier still runs on an empty tail
        let tail = match self.store.load_tail(session_id, tail_size).await {
            Ok(tail) => tail,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "tail load failed; using empty tail");
                vec![]
            }
        };

        if let Err(e) = self.store.append(session_id, ConversationMessage::user(text)).await {
            tracing::warn!(session_id, error = %e, "user append failed");
        }

        if self.complexity.detect(text).await == Complexity::Complex && self.agent_enabled {
            return self.run_agent(conn, session_id, text, &tail, cancel).await;
        }

        let started = Instant::now();
        let Classification { mut candidates, .. } = self
            .classifier
            .classify(text, &tail, &self.registry.list_for_prompt(), None, &self.server_examples())
            .await;
        metrics::record_classifier_latency(started.elapsed().as_secs_f64());

        if use_rag {
            // the client pinned retrieval; try it before the ranked list
            if let Ok(pinned) = IntentCandidate::new("knowledge.ask", 1.0) {
                candidates.insert(0, pinned);
            }
        }

        let mut metadata = MessageMetadata::new();
        let mut tool_summary: Option<serde_json::Value> = None;
        let mut retrieval: Option<RetrievalBundle> = None;
        let mut chosen: Option<IntentCandidate> = None;

        for candidate in &candidates {
            if cancel.is_cancelled() {
                return None;
            }
            let label = candidate.label();
            match self
                .executor
                .execute(
                    candidate,
                    text,
                    knowledge_base,
                    &conn.permission,
                    Some(self.tool_deadline),
                    cancel,
                )
                .await
            {
                Ok(ExecutionOutcome::NoAction) => {
                    chosen = Some(candidate.clone());
                    break;
                }
                Ok(ExecutionOutcome::Ok(value)) => {
                    metrics::record_tool_call(true);
                    metadata.tool_calls.push(label.clone());
                    let _ = conn
                        .send(ServerMessage::Action { intent: label, result: value.clone() })
                        .await;
                    tool_summary = Some(value);
                    chosen = Some(candidate.clone());
                    break;
                }
                Ok(ExecutionOutcome::Retrieved(bundle)) => {
                    retrieval = Some(bundle);
                    chosen = Some(candidate.clone());
                    break;
                }
                Ok(ExecutionOutcome::OkEmpty) => {
                    metadata.record_skip(&label, "ok-empty");
                }
                Err(e) if !e.chain_continues() => {
                    // permission denial terminates the chain, visibly
                    tracing::info!(session_id, label, "denied by permission predicate");
                    let _ = conn
                        .send(ServerMessage::Stream { content: DENIAL_LINE.to_string() })
                        .await;
                    return Some(ExchangeOutcome {
                        answer: DENIAL_LINE.to_string(),
                        metadata: metadata.with_intent(label, candidate.confidence),
                        agent_steps: None,
                    });
                }
                Err(e) => {
                    metrics::record_tool_call(false);
                    tracing::warn!(session_id, label, kind = e.kind(), "candidate failed");
                    metadata.record_skip(&label, e.kind());
                }
            }
        }

        let chosen = match chosen {
            Some(candidate) => candidate,
            None if self.agent_enabled => {
                // ranked list exhausted: the agent is the last resort
                tracing::debug!(session_id, "fallback chain exhausted; invoking agent");
                let mut outcome = self.run_agent(conn, session_id, text, &tail, cancel).await?;
                outcome.metadata.skipped = metadata.skipped;
                return Some(outcome);
            }
            None => IntentCandidate::general_conversation(),
        };

        metadata.intent = Some(chosen.label());
        metadata.confidence = Some(chosen.confidence);

        let answer = self
            .stream_response(conn, text, &tail, tool_summary.as_ref(), retrieval.as_ref(), cancel)
            .await?;

        Some(ExchangeOutcome { answer, metadata, agent_steps: None })
    }

    async fn run_agent(
        &self,
        conn: &Arc<Connection>,
        session_id: &str,
        text: &str,
        tail: &[ConversationMessage],
        cancel: &CancellationToken,
    ) -> Option<ExchangeOutcome> {
        let (event_tx, mut event_rx) = mpsc::channel::<hearth_agent::AgentEvent>(32);
        let (token_tx, mut token_rx) = mpsc::channel::<String>(32);

        let forward_conn = Arc::clone(conn);
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = event_rx.recv() => match event {
                        Some(event) => {
                            let _ = forward_conn.send(event.into()).await;
                        }
                        None => break,
                    },
                    token = token_rx.recv() => match token {
                        Some(token) => {
                            let _ = forward_conn.transition(PipelineState::Streaming).await;
                            let _ = forward_conn.send(ServerMessage::Stream { content: token }).await;
                        }
                        None => break,
                    },
                }
            }
            // drain whichever side is still open
            while let Some(event) = event_rx.recv().await {
                let _ = forward_conn.send(event.into()).await;
            }
            while let Some(token) = token_rx.recv().await {
                let _ = forward_conn.send(ServerMessage::Stream { content: token }).await;
            }
        });

        let result = self
            .agent
            .run(session_id, text, tail, &conn.permission, event_tx, token_tx, cancel)
            .await;
        let _ = forwarder.await;

        match result {
            Ok(run) => {
                metrics::record_agent_run(run.steps, run.budget_exhausted);
                Some(ExchangeOutcome {
                    answer: run.answer,
                    metadata: MessageMetadata::new().with_agent(run.steps),
                    agent_steps: Some(run.steps),
                })
            }
            Err(hearth_agent::AgentError::Cancelled) => None,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "agent run failed");
                let _ = conn
                    .send(ServerMessage::Stream { content: TEMPORARY_FAILURE.to_string() })
                    .await;
                Some(ExchangeOutcome {
                    answer: TEMPORARY_FAILURE.to_string(),
                    metadata: MessageMetadata::new(),
                    agent_steps: None,
                })
            }
        }
    }

    /// Compose the response prompt and stream the LM reply chunk by chunk.
    async fn stream_response(
        &self,
        conn: &Arc<Connection>,
        text: &str,
        tail: &[ConversationMessage],
        tool_summary: Option<&serde_json::Value>,
        retrieval: Option<&RetrievalBundle>,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let mut system = String::from(
            "You are a helpful household assistant. Answer briefly and \
             conversationally; the reply may be spoken aloud.",
        );
        if let Some(summary) = tool_summary {
            system.push_str(&format!("\n\nA tool already ran for this request; its result:\n{summary}"));
        }
        if let Some(bundle) = retrieval {
            system.push_str(&format!(
                "\n\nAnswer from these documents:\n{}",
                bundle.as_context()
            ));
        }

        let mut messages = vec![ChatMessage::system(system)];
        for message in tail {
            messages.push(match message.role {
                Role::User => ChatMessage::user(&message.content),
                Role::Assistant => ChatMessage::assistant(&message.content),
            });
        }
        messages.push(ChatMessage::user(text));

        let (tx, mut rx) = mpsc::channel::<String>(8);
        let options = LlmOptions::for_role(LlmRole::Chat);

        let llm = Arc::clone(&self.llm);
        let generation =
            tokio::spawn(async move { llm.chat_stream(&messages, &options, tx).await });

        let mut answer = String::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // dropping rx tears the LM stream down best-effort
                    drop(rx);
                    generation.abort();
                    return None;
                }
                token = rx.recv() => match token {
                    Some(token) => {
                        let _ = conn.transition(PipelineState::Streaming).await;
                        answer.push_str(&token);
                        let _ = conn.send(ServerMessage::Stream { content: token }).await;
                    }
                    None => break,
                },
            }
        }

        match generation.await {
            Ok(Ok(full)) => {
                // the backend's accumulated text is authoritative
                if !full.is_empty() {
                    answer = full;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "LM stream failed");
                if answer.is_empty() {
                    answer = TEMPORARY_FAILURE.to_string();
                    let _ = conn
                        .send(ServerMessage::Stream { content: answer.clone() })
                        .await;
                }
            }
            Err(_) => return None,
        }

        Some(answer)
    }

    /// Synthesize and route audio when the utterance came from a
    /// room-bound connection that wants audio out.
    async fn route_audio(&self, conn: &Arc<Connection>, session_id: &str, answer: &str) -> bool {
        let room_id = conn.room_id.read().clone();
        let (Some(room_id), Some(tts)) = (room_id, self.tts.as_ref()) else {
            return false;
        };

        let capabilities = conn.capabilities.read().clone();
        let room = match self.directory.room(&room_id).await {
            Ok(room) => room,
            Err(e) => {
                tracing::warn!(room_id, error = %e, "room lookup failed");
                None
            }
        };
        let has_sinks = room.as_ref().map(|r| !r.sinks.is_empty()).unwrap_or(false);
        if !capabilities.speaker && !has_sinks {
            return false;
        }

        let clip = match tts.synthesize(answer).await {
            Ok(clip) => clip,
            Err(e) => {
                tracing::warn!(error = %e, "TTS synthesis failed; text-only reply");
                return false;
            }
        };

        let input = InputDeviceRef {
            device_id: conn.device_id.read().clone(),
            has_speaker: capabilities.speaker,
        };
        let delivery = self.output.deliver(room.as_ref(), &input, &clip, session_id).await;

        if delivery == Delivery::InputDevice {
            // the asker plays it: push the frames down its own transport
            if let Some(device_id) = &input.device_id {
                use base64::Engine as _;
                let audio = base64::engine::general_purpose::STANDARD.encode(&clip.data);
                let _ = conn
                    .send(ServerMessage::TtsAudio {
                        audio,
                        is_final: true,
                        session_id: session_id.to_string(),
                    })
                    .await;
                tracing::debug!(device_id, "audio handed back to input device");
            }
        }

        delivery.tts_handled()
    }

    /// Per-server illustration examples for the classifier prompt.
    fn server_examples(&self) -> Vec<(String, Vec<String>)> {
        self.registry
            .server_entries()
            .iter()
            .filter_map(|entry| {
                let intent = entry.example_intent.clone()?;
                let queries: Vec<String> =
                    entry.examples.values().flat_map(|v| v.iter().cloned()).collect();
                if queries.is_empty() {
                    None
                } else {
                    Some((intent, queries))
                }
            })
            .collect()
    }
}

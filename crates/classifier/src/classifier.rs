//! The LM-driven intent classifier

use std::sync::Arc;
use std::time::Duration;

use hearth_core::{
    ConversationMessage, Correction, FeedbackScope, FeedbackStore, IntentCandidate,
    LanguageModel, LlmOptions, LlmRole,
};
use hearth_store::CountCache;
use hearth_tools::ToolDescriptor;

use crate::prompt::{build_classifier_prompt, ClassifierPromptInputs};

/// Classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Minimum cosine similarity for a feedback few-shot
    pub match_threshold: f32,
    /// Few-shot cap per prompt
    pub fewshot_max: usize,
    /// Per-LM-call deadline
    pub call_timeout: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.75,
            fewshot_max: 4,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of one classification
#[derive(Debug, Clone)]
pub struct Classification {
    /// 1-3 candidates, confidence non-increasing
    pub candidates: Vec<IntentCandidate>,
    /// The LM reply had no parseable candidate block
    pub parse_error: bool,
}

/// Intent classifier
pub struct IntentClassifier {
    llm: Arc<dyn LanguageModel>,
    feedback: Arc<dyn FeedbackStore>,
    counts: Arc<CountCache>,
    config: ClassifierConfig,
}

impl IntentClassifier {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        feedback: Arc<dyn FeedbackStore>,
        counts: Arc<CountCache>,
        config: ClassifierConfig,
    ) -> Self {
        Self { llm, feedback, counts, config }
    }

    /// Classify a query into a ranked candidate list.
    ///
    /// Always returns at least one candidate; LM and parse failures fall
    /// back to `general.conversation` rather than failing the request.
    pub async fn classify(
        &self,
        query: &str,
        tail: &[ConversationMessage],
        tools: &[ToolDescriptor],
        glossary: Option<&str>,
        server_examples: &[(String, Vec<String>)],
    ) -> Classification {
        let fewshots = self.load_fewshots(query).await;

        let prompt = build_classifier_prompt(&ClassifierPromptInputs {
            query,
            tail,
            tools,
            glossary,
            server_examples,
            fewshots: &fewshots,
        });

        let options = LlmOptions::for_role(LlmRole::Classifier)
            .with_deadline(self.config.call_timeout);

        let reply = match self.llm.generate(&prompt, &options).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "classifier LM call failed; using general.conversation");
                return Classification {
                    candidates: vec![IntentCandidate::general_conversation()],
                    parse_error: false,
                };
            }
        };

        match parse_candidates(&reply) {
            Some(candidates) if !candidates.is_empty() => {
                Classification { candidates, parse_error: false }
            }
            _ => {
                tracing::warn!(reply = %truncate(&reply, 200), "no parseable candidate block");
                Classification {
                    candidates: vec![IntentCandidate::general_conversation()],
                    parse_error: true,
                }
            }
        }
    }

    /// Nearest-neighbour corrections for the classification scope.
    ///
    /// The count cache lets us skip the embedding round-trip when the scope
    /// has no corrections at all.
    async fn load_fewshots(&self, query: &str) -> Vec<Correction> {
        let scope = FeedbackScope::IntentClassification;
        match self.counts.count(self.feedback.as_ref(), scope).await {
            Ok(0) => return vec![],
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "feedback count failed; skipping few-shots");
                return vec![];
            }
        }

        let embedding = match self.llm.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed; skipping few-shots");
                return vec![];
            }
        };

        self.feedback
            .find_similar(
                &embedding,
                scope,
                self.config.match_threshold,
                self.config.fewshot_max,
            )
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "feedback lookup failed");
                vec![]
            })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(serde::Deserialize)]
struct RawCandidate {
    #[serde(alias = "intent")]
    label: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    params: std::collections::HashMap<String, serde_json::Value>,
}

/// Extract the first well-formed candidate block from LM output.
///
/// The model is told to answer with bare JSON but routinely wraps it in
/// prose or code fences; scan for the first position where a JSON value
/// parses and contains candidates.
pub fn parse_candidates(reply: &str) -> Option<Vec<IntentCandidate>> {
    for (idx, ch) in reply.char_indices() {
        if ch != '[' && ch != '{' {
            continue;
        }
        let mut iter = serde_json::Deserializer::from_str(&reply[idx..]).into_iter::<serde_json::Value>();
        let value = match iter.next() {
            Some(Ok(value)) => value,
            _ => continue,
        };
        if let Some(candidates) = candidates_from_value(value) {
            return Some(candidates);
        }
    }
    None
}

fn candidates_from_value(value: serde_json::Value) -> Option<Vec<IntentCandidate>> {
    let raw: Vec<RawCandidate> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value).ok()?,
        serde_json::Value::Object(ref obj) if obj.contains_key("candidates") => {
            serde_json::from_value(obj.get("candidates").cloned()?).ok()?
        }
        serde_json::Value::Object(_) => vec![serde_json::from_value(value).ok()?],
        _ => return None,
    };

    let mut candidates: Vec<IntentCandidate> = raw
        .into_iter()
        .filter_map(|r| match IntentCandidate::parse_label(&r.label) {
            Ok(action) => Some(IntentCandidate {
                action,
                params: r.params,
                confidence: r.confidence.clamp(0.0, 1.0),
            }),
            Err(e) => {
                tracing::debug!(label = %r.label, error = %e, "dropping invalid candidate");
                None
            }
        })
        .collect();

    if candidates.is_empty() {
        return None;
    }

    candidates.sort_by(|a, b| {
        b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(3);
    Some(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hearth_core::{ChatMessage, LocalCategory, Result};
    use hearth_store::MemoryFeedbackStore;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
        embedding: Vec<f32>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().rev().map(String::from).collect()),
                embedding: vec![1.0, 0.0],
            }
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
            let mut replies = self.replies.lock().unwrap();
            replies
                .pop()
                .ok_or_else(|| hearth_core::Error::Llm("script exhausted".to_string()))
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.embedding.clone())
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn model_for(&self, _role: LlmRole) -> String {
            "scripted".to_string()
        }
    }

    fn classifier(replies: Vec<&str>) -> IntentClassifier {
        IntentClassifier::new(
            Arc::new(ScriptedLlm::new(replies)),
            Arc::new(MemoryFeedbackStore::new()),
            Arc::new(CountCache::new(Duration::from_secs(60))),
            ClassifierConfig::default(),
        )
    }

    #[test]
    fn test_parse_bare_array() {
        let candidates = parse_candidates(
            r#"[{"label": "home_assistant.turn_on", "confidence": 0.95,
                "params": {"entity": "light.office"}},
               {"label": "general.conversation", "confidence": 0.2}]"#,
        )
        .unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].label(), "home_assistant.turn_on");
        assert_eq!(
            candidates[0].params.get("entity").and_then(|v| v.as_str()),
            Some("light.office")
        );
    }

    #[test]
    fn test_parse_with_surrounding_prose() {
        let reply = "Sure! Here is the classification:\n```json\n\
                     [{\"label\": \"knowledge.ask\", \"confidence\": 0.6}]\n```\nDone.";
        let candidates = parse_candidates(reply).unwrap();
        assert!(candidates[0].is_local(LocalCategory::KnowledgeAsk));
    }

    #[test]
    fn test_parse_sorts_and_truncates() {
        let reply = r#"[
            {"label": "general.conversation", "confidence": 0.1},
            {"label": "knowledge.ask", "confidence": 0.9},
            {"label": "media.play", "confidence": 0.5},
            {"label": "media.pause", "confidence": 0.4}
        ]"#;
        let candidates = parse_candidates(reply).unwrap();
        assert_eq!(candidates.len(), 3);
        assert!(candidates[0].confidence >= candidates[1].confidence);
        assert!(candidates[1].confidence >= candidates[2].confidence);
        assert_eq!(candidates[0].label(), "knowledge.ask");
    }

    #[test]
    fn test_parse_object_with_candidates_key() {
        let reply = r#"{"candidates": [{"intent": "home_assistant.turn_off", "confidence": 0.8}]}"#;
        let candidates = parse_candidates(reply).unwrap();
        assert_eq!(candidates[0].label(), "home_assistant.turn_off");
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(parse_candidates("I could not decide at all.").is_none());
        assert!(parse_candidates("{\"label\": \"noperiod\", \"confidence\": 1}").is_none());
    }

    #[tokio::test]
    async fn test_classify_falls_back_on_garbage() {
        let c = classifier(vec!["no json here"]);
        let result = c.classify("hello", &[], &[], None, &[]).await;
        assert!(result.parse_error);
        assert_eq!(result.candidates.len(), 1);
        assert!(result.candidates[0].is_local(LocalCategory::GeneralConversation));
    }

    #[tokio::test]
    async fn test_classify_falls_back_on_llm_failure() {
        let c = classifier(vec![]);
        let result = c.classify("hello", &[], &[], None, &[]).await;
        assert!(!result.parse_error);
        assert!(result.candidates[0].is_local(LocalCategory::GeneralConversation));
    }

    #[tokio::test]
    async fn test_classify_happy_path() {
        let c = classifier(vec![
            r#"[{"label": "home_assistant.turn_on", "confidence": 0.95,
                 "params": {"entity": "light.office"}}]"#,
        ]);
        let result = c.classify("Turn on the lamp in the office.", &[], &[], None, &[]).await;
        assert!(!result.parse_error);
        assert_eq!(result.candidates[0].label(), "home_assistant.turn_on");
    }
}

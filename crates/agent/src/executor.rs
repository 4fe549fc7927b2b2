//! The action executor
//!
//! Executes one intent candidate exactly once: a `<server>.<tool>` label
//! delegates to the registry, `knowledge.ask` to the retrieval collaborator,
//! `general.conversation` is a no-op sentinel. The connection's permission
//! predicate is checked before anything runs.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use hearth_core::{
    CandidateAction, IntentCandidate, LocalCategory, PermissionPredicate, RetrievalBundle,
    Retriever,
};
use hearth_tools::{InvokeError, ToolRegistry};

/// Successful outcomes, with empty results kept distinct
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The tool ran and returned a useful payload
    Ok(serde_json::Value),
    /// The tool ran but produced nothing useful; try the next candidate
    OkEmpty,
    /// `general.conversation`: nothing to execute, stream a direct answer
    NoAction,
    /// `knowledge.ask`: a document-grounded context bundle
    Retrieved(RetrievalBundle),
}

/// Execution failures
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),
}

impl ExecutionError {
    /// Stable kind string for logs and message metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::NotPermitted(_) => "not-permitted",
            ExecutionError::Invoke(e) => e.kind(),
            ExecutionError::Retrieval(_) => "retrieval-failed",
        }
    }

    /// Whether the fallback chain should move on to the next candidate.
    /// Permission denials terminate the chain instead.
    pub fn chain_continues(&self) -> bool {
        !matches!(self, ExecutionError::NotPermitted(_))
    }
}

/// Resolves one candidate to a tool call or a local handler
pub struct ActionExecutor {
    registry: Arc<ToolRegistry>,
    retriever: Arc<dyn Retriever>,
    retrieval_limit: usize,
}

impl ActionExecutor {
    pub fn new(registry: Arc<ToolRegistry>, retriever: Arc<dyn Retriever>) -> Self {
        Self { registry, retriever, retrieval_limit: 5 }
    }

    /// Execute `candidate` for `query` under the connection's permission
    /// predicate. At-most-once: no internal retries.
    pub async fn execute(
        &self,
        candidate: &IntentCandidate,
        query: &str,
        knowledge_base: Option<&str>,
        permission: &PermissionPredicate,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let label = candidate.label();
        if !permission(&label) {
            tracing::info!(label, "permission denied");
            return Err(ExecutionError::NotPermitted(label));
        }

        match &candidate.action {
            CandidateAction::Local(LocalCategory::GeneralConversation) => {
                Ok(ExecutionOutcome::NoAction)
            }
            CandidateAction::Local(LocalCategory::KnowledgeAsk) => {
                let bundle = self
                    .retriever
                    .retrieve(query, knowledge_base, self.retrieval_limit)
                    .await
                    .map_err(|e| ExecutionError::Retrieval(e.to_string()))?;
                if bundle.is_empty() {
                    Ok(ExecutionOutcome::OkEmpty)
                } else {
                    Ok(ExecutionOutcome::Retrieved(bundle))
                }
            }
            CandidateAction::Tool { .. } => {
                let params = serde_json::Value::Object(
                    candidate.params.clone().into_iter().collect(),
                );
                let value = self
                    .registry
                    .invoke_cancellable(&label, &params, deadline, cancel)
                    .await?;
                if is_empty_result(&value) {
                    Ok(ExecutionOutcome::OkEmpty)
                } else {
                    Ok(ExecutionOutcome::Ok(value))
                }
            }
        }
    }
}

/// The per-tool success-with-no-value predicate.
///
/// Empty lists, zero-hit payloads and blank strings count as empty; any
/// other 2xx payload is a real result.
fn is_empty_result(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Object(obj) => {
            if let Some(found) = obj.get("found").and_then(|v| v.as_u64()) {
                return found == 0;
            }
            if let Some(results) = obj.get("results").and_then(|v| v.as_array()) {
                return results.is_empty();
            }
            obj.is_empty()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hearth_config::{EnabledFlag, ServerTransportKind, ToolServerEntry};
    use hearth_core::{allow_all, Document, Result};
    use hearth_tools::{RemoteToolSpec, ServerTransport};
    use serde_json::json;
    use std::collections::HashMap;

    struct StaticRetriever {
        documents: Vec<Document>,
    }

    #[async_trait]
    impl Retriever for StaticRetriever {
        async fn retrieve(
            &self,
            _query: &str,
            _knowledge_base: Option<&str>,
            _limit: usize,
        ) -> Result<RetrievalBundle> {
            Ok(RetrievalBundle { documents: self.documents.clone() })
        }
    }

    struct FixedTransport {
        result: serde_json::Value,
    }

    #[async_trait]
    impl ServerTransport for FixedTransport {
        async fn list_tools(&self) -> std::result::Result<Vec<RemoteToolSpec>, InvokeError> {
            Ok(vec![RemoteToolSpec {
                name: "turn_on".to_string(),
                description: "Turn on a device".to_string(),
                input_schema: json!({}),
            }])
        }

        async fn invoke(
            &self,
            _tool: &str,
            _params: &serde_json::Value,
            _deadline: Duration,
        ) -> std::result::Result<serde_json::Value, InvokeError> {
            Ok(self.result.clone())
        }
    }

    async fn executor(
        tool_result: serde_json::Value,
        documents: Vec<Document>,
    ) -> ActionExecutor {
        let mut registry = ToolRegistry::new(Duration::from_secs(5));
        registry.add_server(
            ToolServerEntry {
                name: "home_assistant".to_string(),
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
            Arc::new(FixedTransport { result: tool_result }),
        );
        let registry = Arc::new(registry);
        registry.refresh_all().await;
        ActionExecutor::new(registry, Arc::new(StaticRetriever { documents }))
    }

    fn doc(content: &str) -> Document {
        Document { title: None, content: content.to_string(), score: 0.9, source: None }
    }

    #[tokio::test]
    async fn test_general_conversation_is_no_action() {
        let exec = executor(json!({}), vec![]).await;
        let candidate = IntentCandidate::general_conversation();
        let outcome = exec
            .execute(&candidate, "hello", None, &allow_all(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::NoAction));
    }

    #[tokio::test]
    async fn test_tool_success() {
        let exec = executor(json!({"acknowledged": true}), vec![]).await;
        let candidate = IntentCandidate::new("home_assistant.turn_on", 0.95)
            .unwrap()
            .with_param("entity", json!("light.office"));
        let outcome = exec
            .execute(&candidate, "turn on the lamp", None, &allow_all(), None, &CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Ok(value) => assert_eq!(value["acknowledged"], true),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_tool_result_is_ok_empty() {
        let exec = executor(json!({"found": 0}), vec![]).await;
        let candidate = IntentCandidate::new("home_assistant.turn_on", 0.95).unwrap();
        let outcome = exec
            .execute(&candidate, "q", None, &allow_all(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::OkEmpty));
    }

    #[tokio::test]
    async fn test_retrieval_zero_hits_is_ok_empty() {
        let exec = executor(json!({}), vec![]).await;
        let candidate = IntentCandidate::new("knowledge.ask", 0.6).unwrap();
        let outcome = exec
            .execute(&candidate, "what happened in 1989", None, &allow_all(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::OkEmpty));
    }

    #[tokio::test]
    async fn test_retrieval_hits_are_returned() {
        let exec = executor(json!({}), vec![doc("the manual says hold five seconds")]).await;
        let candidate = IntentCandidate::new("knowledge.ask", 0.6).unwrap();
        let outcome = exec
            .execute(&candidate, "how do I reset it", None, &allow_all(), None, &CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Retrieved(bundle) => assert_eq!(bundle.documents.len(), 1),
            other => panic!("expected Retrieved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permission_denied_stops_chain() {
        let exec = executor(json!({}), vec![]).await;
        let candidate = IntentCandidate::new("home_assistant.turn_on", 0.95).unwrap();
        let deny: PermissionPredicate =
            Arc::new(|label: &str| !label.starts_with("home_assistant."));

        let err = exec
            .execute(&candidate, "q", None, &deny, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NotPermitted(_)));
        assert!(!err.chain_continues());
        assert_eq!(err.kind(), "not-permitted");
    }

    #[tokio::test]
    async fn test_unknown_tool_continues_chain() {
        let exec = executor(json!({}), vec![]).await;
        let candidate = IntentCandidate::new("nope.missing", 0.9).unwrap();
        let err = exec
            .execute(&candidate, "q", None, &allow_all(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.chain_continues());
        assert_eq!(err.kind(), "tool-unknown");
    }

    #[test]
    fn test_empty_result_predicate() {
        assert!(is_empty_result(&json!(null)));
        assert!(is_empty_result(&json!([])));
        assert!(is_empty_result(&json!("")));
        assert!(is_empty_result(&json!({})));
        assert!(is_empty_result(&json!({"found": 0})));
        assert!(is_empty_result(&json!({"results": []})));
        assert!(!is_empty_result(&json!({"found": 3})));
        assert!(!is_empty_result(&json!({"acknowledged": true})));
        assert!(!is_empty_result(&json!([1])));
        assert!(!is_empty_result(&json!(42)));
    }
}

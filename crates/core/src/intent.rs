//! Intent candidates
//!
//! A classifier response is an ordered list of 1-3 candidates sorted by
//! descending confidence. A candidate is either a fully qualified tool call
//! (`<server>.<tool>`) or one of the locally handled categories.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Categories resolved inside the core rather than by an external tool server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalCategory {
    /// Retrieval over user documents via the external retriever
    KnowledgeAsk,
    /// No tool; the LM answers directly
    GeneralConversation,
}

impl LocalCategory {
    pub fn label(&self) -> &'static str {
        match self {
            LocalCategory::KnowledgeAsk => "knowledge.ask",
            LocalCategory::GeneralConversation => "general.conversation",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "knowledge.ask" => Some(LocalCategory::KnowledgeAsk),
            "general.conversation" => Some(LocalCategory::GeneralConversation),
            _ => None,
        }
    }
}

/// What a candidate resolves to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CandidateAction {
    Local(LocalCategory),
    Tool { server: String, tool: String },
}

/// One classifier hypothesis: label, parameters, confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentCandidate {
    pub action: CandidateAction,
    /// Scalar parameters extracted by the classifier
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    /// Self-reported confidence, clamped to [0, 1]
    pub confidence: f32,
}

impl IntentCandidate {
    /// Parse a dotted label into a candidate action.
    ///
    /// Labels of the locally handled categories take priority; anything else
    /// must have the `<server>.<tool>` shape with both parts non-empty.
    pub fn parse_label(label: &str) -> Result<CandidateAction, Error> {
        if let Some(local) = LocalCategory::from_label(label) {
            return Ok(CandidateAction::Local(local));
        }
        match label.split_once('.') {
            Some((server, tool)) if !server.is_empty() && !tool.is_empty() => {
                Ok(CandidateAction::Tool {
                    server: server.to_string(),
                    tool: tool.to_string(),
                })
            }
            _ => Err(Error::InvalidLabel(label.to_string())),
        }
    }

    pub fn new(label: &str, confidence: f32) -> Result<Self, Error> {
        Ok(Self {
            action: Self::parse_label(label)?,
            params: HashMap::new(),
            confidence: confidence.clamp(0.0, 1.0),
        })
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// The degenerate candidate returned when nothing else applies
    pub fn general_conversation() -> Self {
        Self {
            action: CandidateAction::Local(LocalCategory::GeneralConversation),
            params: HashMap::new(),
            confidence: 1.0,
        }
    }

    /// The dotted label for this candidate
    pub fn label(&self) -> String {
        match &self.action {
            CandidateAction::Local(cat) => cat.label().to_string(),
            CandidateAction::Tool { server, tool } => format!("{}.{}", server, tool),
        }
    }

    pub fn is_local(&self, category: LocalCategory) -> bool {
        matches!(&self.action, CandidateAction::Local(c) if *c == category)
    }
}

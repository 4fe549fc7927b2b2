//! Complexity detection
//!
//! A fast, deterministic pattern pass decides whether a query needs the
//! multi-step agent: no LM call on this path. Feedback corrections for the
//! complexity-routing scope can flip the verdict for semantically similar
//! queries.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use hearth_core::{FeedbackScope, FeedbackStore, LanguageModel};
use hearth_store::CountCache;

/// Routing verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Complex,
}

/// Pattern-based complexity detector with feedback override
pub struct ComplexityDetector {
    patterns: Vec<Regex>,
    llm: Arc<dyn LanguageModel>,
    feedback: Arc<dyn FeedbackStore>,
    counts: Arc<CountCache>,
    match_threshold: f32,
    /// When the agent loop is globally disabled everything routes simple
    agent_enabled: bool,
}

impl ComplexityDetector {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        feedback: Arc<dyn FeedbackStore>,
        counts: Arc<CountCache>,
        match_threshold: f32,
        agent_enabled: bool,
    ) -> Self {
        let patterns = vec![
            // sequenced actions
            Regex::new(r"(?i)\b(and then|after that|first\b.*\bthen)\b").unwrap(),
            // conditional
            Regex::new(r"(?i)\b(if|when|unless|depending on)\b.*\b(then|otherwise|else)\b").unwrap(),
            // comparative
            Regex::new(r"(?i)\b(compare|versus|vs\.?|which is (better|cheaper|closer))\b").unwrap(),
            // two requests joined in one utterance
            Regex::new(r"(?i)\b(and also|as well as|plus find|and find|and look up|and book|and search)\b").unwrap(),
        ];
        Self { patterns, llm, feedback, counts, match_threshold, agent_enabled }
    }

    /// Deterministic pattern verdict, before any feedback override.
    pub fn base_verdict(&self, query: &str) -> Complexity {
        if self.patterns.iter().any(|p| p.is_match(query)) {
            return Complexity::Complex;
        }
        // multi-clause utterance that both asks and requests
        let clauses = query.split(" and ").filter(|c| c.split_whitespace().count() >= 3).count();
        if clauses >= 2 && query.contains('?') {
            return Complexity::Complex;
        }
        Complexity::Simple
    }

    /// Final verdict for a query.
    pub async fn detect(&self, query: &str) -> Complexity {
        if !self.agent_enabled {
            return Complexity::Simple;
        }

        let verdict = self.base_verdict(query);

        // A stored correction for a semantically similar query flips the
        // pattern verdict in either direction.
        let scope = FeedbackScope::ComplexityRouting;
        match self.counts.count(self.feedback.as_ref(), scope).await {
            Ok(0) | Err(_) => return verdict,
            Ok(_) => {}
        }

        let embedding = match self.llm.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed; keeping pattern verdict");
                return verdict;
            }
        };

        let corrections = self
            .feedback
            .find_similar(&embedding, scope, self.match_threshold, 1)
            .await
            .unwrap_or_default();

        match corrections.first().map(|c| c.right_label.as_str()) {
            Some("complex") => {
                tracing::debug!(query, "feedback override: complex");
                Complexity::Complex
            }
            Some("simple") => {
                tracing::debug!(query, "feedback override: simple");
                Complexity::Simple
            }
            _ => verdict,
        }
    }
}

//! In-memory feedback store and the process-wide count cache
//!
//! Corrections are (scope, query, embedding, wrong label, right label)
//! triples. Retrieval is cosine nearest-neighbour over the query embedding,
//! scope-filtered. Saving the same correction twice is a no-op so few-shots
//! never double-weight.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use hearth_core::{Correction, FeedbackScope, FeedbackStore, Result};

/// Cosine similarity; 0.0 when dimensions differ or either vector is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// In-memory feedback store
#[derive(Default)]
pub struct MemoryFeedbackStore {
    corrections: RwLock<Vec<Correction>>,
}

impl MemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedbackStore for MemoryFeedbackStore {
    async fn save(&self, correction: Correction) -> Result<()> {
        let mut corrections = self.corrections.write();
        let duplicate = corrections.iter().any(|c| {
            c.scope == correction.scope
                && c.query == correction.query
                && c.wrong_label == correction.wrong_label
                && c.right_label == correction.right_label
        });
        if duplicate {
            tracing::debug!(scope = correction.scope.as_str(), "duplicate correction ignored");
            return Ok(());
        }
        corrections.push(correction);
        Ok(())
    }

    async fn count(&self, scope: FeedbackScope) -> Result<usize> {
        Ok(self.corrections.read().iter().filter(|c| c.scope == scope).count())
    }

    async fn find_similar(
        &self,
        query: &[f32],
        scope: FeedbackScope,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<Correction>> {
        let mut scored: Vec<(f32, Correction)> = self
            .corrections
            .read()
            .iter()
            .filter(|c| c.scope == scope)
            .map(|c| (cosine_similarity(query, &c.embedding), c.clone()))
            .filter(|(score, _)| *score >= threshold)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, c)| c).collect())
    }
}

/// Process-wide per-scope count cache with a short TTL.
///
/// Lets the classifier skip the embedding round-trip entirely when no
/// corrections exist for a scope. Reads are lock-free; entries expire by
/// wall clock.
pub struct CountCache {
    ttl: Duration,
    entries: DashMap<FeedbackScope, (Instant, usize)>,
}

impl CountCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: DashMap::new() }
    }

    /// Cached correction count for `scope`, consulting `store` on miss.
    pub async fn count(&self, store: &dyn FeedbackStore, scope: FeedbackScope) -> Result<usize> {
        if let Some(entry) = self.entries.get(&scope) {
            let (at, count) = *entry;
            if at.elapsed() < self.ttl {
                return Ok(count);
            }
        }
        let count = store.count(scope).await?;
        self.entries.insert(scope, (Instant::now(), count));
        Ok(count)
    }

    /// Drop a scope's entry (after a new correction lands).
    pub fn invalidate(&self, scope: FeedbackScope) {
        self.entries.remove(&scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correction(scope: FeedbackScope, query: &str, embedding: Vec<f32>) -> Correction {
        Correction::new(scope, query, embedding, "knowledge.ask", "general.conversation")
    }

    #[test]
    fn test_cosine() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = MemoryFeedbackStore::new();
        let c = correction(FeedbackScope::IntentClassification, "what year", vec![1.0, 0.0]);
        store.save(c.clone()).await.unwrap();
        store.save(c).await.unwrap();

        assert_eq!(store.count(FeedbackScope::IntentClassification).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_similar_scope_and_threshold() {
        let store = MemoryFeedbackStore::new();
        store
            .save(correction(FeedbackScope::IntentClassification, "a", vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .save(correction(FeedbackScope::ComplexityRouting, "b", vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .save(correction(FeedbackScope::IntentClassification, "c", vec![0.0, 1.0]))
            .await
            .unwrap();

        let hits = store
            .find_similar(&[1.0, 0.0], FeedbackScope::IntentClassification, 0.75, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].query, "a");
    }

    #[tokio::test]
    async fn test_find_similar_orders_best_first() {
        let store = MemoryFeedbackStore::new();
        store
            .save(correction(FeedbackScope::AgentToolChoice, "near", vec![0.9, 0.1]))
            .await
            .unwrap();
        store
            .save(correction(FeedbackScope::AgentToolChoice, "exact", vec![1.0, 0.0]))
            .await
            .unwrap();

        let hits = store
            .find_similar(&[1.0, 0.0], FeedbackScope::AgentToolChoice, 0.5, 5)
            .await
            .unwrap();
        assert_eq!(hits[0].query, "exact");
        assert_eq!(hits[1].query, "near");
    }

    #[tokio::test]
    async fn test_count_cache_ttl() {
        let store = MemoryFeedbackStore::new();
        let cache = CountCache::new(Duration::from_secs(60));

        assert_eq!(
            cache.count(&store, FeedbackScope::IntentClassification).await.unwrap(),
            0
        );

        store
            .save(correction(FeedbackScope::IntentClassification, "x", vec![1.0]))
            .await
            .unwrap();

        // stale until invalidated or expired
        assert_eq!(
            cache.count(&store, FeedbackScope::IntentClassification).await.unwrap(),
            0
        );
        cache.invalidate(FeedbackScope::IntentClassification);
        assert_eq!(
            cache.count(&store, FeedbackScope::IntentClassification).await.unwrap(),
            1
        );
    }
}

//! In-memory conversation store
//!
//! Append-only per-session logs. Appends to one session are serialized by
//! the session's own async lock so timestamps stay monotonic within a
//! session; cross-session appends interleave freely.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use hearth_core::{ConversationMessage, ConversationStore, Result, StoreStats};

#[derive(Default)]
struct SessionLog {
    messages: Vec<ConversationMessage>,
}

/// In-memory store, the default adapter
#[derive(Default)]
pub struct MemoryConversationStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionLog>>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_log(&self, session: &str) -> Arc<Mutex<SessionLog>> {
        if let Some(log) = self.sessions.read().get(session) {
            return Arc::clone(log);
        }
        let mut sessions = self.sessions.write();
        Arc::clone(
            sessions
                .entry(session.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SessionLog::default()))),
        )
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append(&self, session: &str, mut message: ConversationMessage) -> Result<()> {
        let log = self.session_log(session);
        let mut log = log.lock().await;

        // Timestamps are strictly increasing per session even when the
        // caller's clock stands still.
        if let Some(last) = log.messages.last() {
            if message.timestamp <= last.timestamp {
                message.timestamp = last.timestamp + Duration::milliseconds(1);
            }
        }

        tracing::trace!(session, role = %message.role, "append message");
        log.messages.push(message);
        Ok(())
    }

    async fn load_tail(&self, session: &str, n: usize) -> Result<Vec<ConversationMessage>> {
        let log = {
            let sessions = self.sessions.read();
            match sessions.get(session) {
                Some(log) => Arc::clone(log),
                None => return Ok(vec![]),
            }
        };
        let log = log.lock().await;
        let start = log.messages.len().saturating_sub(n);
        Ok(log.messages[start..].to_vec())
    }

    async fn delete(&self, session: &str) -> Result<()> {
        self.sessions.write().remove(session);
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(String, ConversationMessage)>> {
        let query = query.to_lowercase();
        let logs: Vec<(String, Arc<Mutex<SessionLog>>)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, log)| (id.clone(), Arc::clone(log)))
            .collect();

        let mut hits = Vec::new();
        for (session, log) in logs {
            let log = log.lock().await;
            for message in &log.messages {
                if message.content.to_lowercase().contains(&query) {
                    hits.push((session.clone(), message.clone()));
                    if hits.len() >= limit {
                        return Ok(hits);
                    }
                }
            }
        }
        Ok(hits)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let logs: Vec<Arc<Mutex<SessionLog>>> =
            self.sessions.read().values().cloned().collect();
        let mut messages = 0;
        for log in &logs {
            messages += log.lock().await.messages.len();
        }
        Ok(StoreStats { sessions: logs.len(), messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::Role;

    #[tokio::test]
    async fn test_append_then_tail() {
        let store = MemoryConversationStore::new();
        store
            .append("s1", ConversationMessage::user("turn on the lamp"))
            .await
            .unwrap();
        store
            .append("s1", ConversationMessage::assistant("Done."))
            .await
            .unwrap();

        let tail = store.load_tail("s1", 10).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].role, Role::User);
        assert_eq!(tail[1].content, "Done.");
    }

    #[tokio::test]
    async fn test_tail_is_prefix_over_time() {
        let store = MemoryConversationStore::new();
        store.append("s1", ConversationMessage::user("one")).await.unwrap();
        let t1 = store.load_tail("s1", 10).await.unwrap();

        store.append("s1", ConversationMessage::user("two")).await.unwrap();
        let t2 = store.load_tail("s1", 10).await.unwrap();

        assert_eq!(t2.len(), t1.len() + 1);
        for (a, b) in t1.iter().zip(t2.iter()) {
            assert_eq!(a.content, b.content);
            assert_eq!(a.timestamp, b.timestamp);
        }
    }

    #[tokio::test]
    async fn test_timestamps_monotonic_per_session() {
        let store = MemoryConversationStore::new();
        // identical wall-clock timestamps on input
        let m = ConversationMessage::user("a");
        let mut m2 = ConversationMessage::user("b");
        m2.timestamp = m.timestamp;

        store.append("s1", m).await.unwrap();
        store.append("s1", m2).await.unwrap();

        let tail = store.load_tail("s1", 10).await.unwrap();
        assert!(tail[0].timestamp < tail[1].timestamp);
    }

    #[tokio::test]
    async fn test_missing_session_is_empty() {
        let store = MemoryConversationStore::new();
        assert!(store.load_tail("nope", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_stats() {
        let store = MemoryConversationStore::new();
        store.append("s1", ConversationMessage::user("hi")).await.unwrap();
        store.append("s2", ConversationMessage::user("ho")).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.messages, 2);

        store.delete("s1").await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.sessions, 1);
    }

    #[tokio::test]
    async fn test_search() {
        let store = MemoryConversationStore::new();
        store
            .append("s1", ConversationMessage::user("what about the Berlin weather"))
            .await
            .unwrap();
        store.append("s2", ConversationMessage::user("hello")).await.unwrap();

        let hits = store.search("berlin", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "s1");
    }
}

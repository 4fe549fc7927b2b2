//! Default collaborator adapters
//!
//! Real deployments wire concrete retrieval, speech and media integrations
//! in; a bare hub starts with these stand-ins so every pipeline path stays
//! exercisable.

use async_trait::async_trait;

use hearth_core::{MediaPlayer, PlayerState, Result, RetrievalBundle, Retriever};

/// Retriever with no document corpus: every query is a zero-hit.
#[derive(Default)]
pub struct NullRetriever;

#[async_trait]
impl Retriever for NullRetriever {
    async fn retrieve(
        &self,
        _query: &str,
        _knowledge_base: Option<&str>,
        _limit: usize,
    ) -> Result<RetrievalBundle> {
        Ok(RetrievalBundle::default())
    }
}

/// Media integration stand-in: every entity is unreachable, so external
/// sink bindings are skipped by the output router.
#[derive(Default)]
pub struct OfflineMediaPlayer;

#[async_trait]
impl MediaPlayer for OfflineMediaPlayer {
    async fn state(&self, _entity_id: &str) -> Result<PlayerState> {
        Ok(PlayerState::Unreachable)
    }

    async fn play(&self, entity_id: &str, _url: &str, _volume: f32) -> Result<()> {
        Err(hearth_core::Error::Media(format!("no media integration for {entity_id}")))
    }
}

//! Shared application state

use std::sync::Arc;

use hearth_config::Settings;
use hearth_core::ConversationStore;
use hearth_output::AudioCache;
use hearth_store::CountCache;
use hearth_tools::ToolRegistry;

use crate::connection::ConnectionRegistry;
use crate::devices::CachedDirectory;
use crate::pipeline::{Pipeline, PipelineDeps};

/// State threaded through every handler
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pipeline: Arc<Pipeline>,
    pub connections: Arc<ConnectionRegistry>,
    pub audio_cache: Arc<AudioCache>,
    pub store: Arc<dyn ConversationStore>,
    pub feedback: Arc<dyn hearth_core::FeedbackStore>,
    pub counts: Arc<CountCache>,
    pub llm: Arc<dyn hearth_core::LanguageModel>,
    pub registry: Arc<ToolRegistry>,
    directory: Arc<CachedDirectory>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        deps: PipelineDeps,
        connections: Arc<ConnectionRegistry>,
        audio_cache: Arc<AudioCache>,
    ) -> Self {
        let store = Arc::clone(&deps.store);
        let feedback = Arc::clone(&deps.feedback);
        let counts = Arc::clone(&deps.counts);
        let llm = Arc::clone(&deps.llm);
        let registry = Arc::clone(&deps.registry);
        let directory = Arc::clone(&deps.directory);
        let pipeline = Arc::new(Pipeline::new(deps, &settings));

        Self {
            settings: Arc::new(settings),
            pipeline,
            connections,
            audio_cache,
            store,
            feedback,
            counts,
            llm,
            registry,
            directory,
        }
    }

    pub fn pipeline_directory(&self) -> &CachedDirectory {
        &self.directory
    }
}

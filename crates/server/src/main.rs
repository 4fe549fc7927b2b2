//! `hearthd` — the assistant hub daemon

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use hearth_config::{load_settings, ToolServerDocument};
use hearth_core::LanguageModel;
use hearth_llm::{LlmBackendConfig, OllamaBackend};
use hearth_output::{AudioCache, OutputRouter, OutputRouterConfig};
use hearth_server::collaborators::{NullRetriever, OfflineMediaPlayer};
use hearth_server::connection::ConnectionRegistry;
use hearth_server::devices::{CachedDirectory, MemoryDirectory};
use hearth_server::{create_router, AppState, PipelineDeps};
use hearth_store::{CountCache, MemoryConversationStore, MemoryFeedbackStore};
use hearth_tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).or_else(|| std::env::var("HEARTH_CONFIG").ok());
    let settings = load_settings(config_path.as_deref()).context("loading settings")?;

    let filter = EnvFilter::try_from_env("HEARTH_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info,hearth=debug"));
    if settings.server.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    hearth_server::metrics::init_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting hearthd");

    // LM backend
    let llm = Arc::new(
        OllamaBackend::new(LlmBackendConfig {
            endpoint: settings.llm.endpoint.clone(),
            chat_model: settings.llm.chat_model.clone(),
            classifier_model: settings.llm.classifier_model.clone(),
            embedding_model: settings.llm.embedding_model.clone(),
            agent_model: settings.agent.model_override.clone(),
            timeout: Duration::from_secs(settings.llm.call_timeout_seconds),
            ..Default::default()
        })
        .context("building LM backend")?,
    );
    if !llm.is_available().await {
        tracing::warn!(endpoint = %settings.llm.endpoint, "LM backend unreachable at startup");
    }

    // Tool registry from the declaration document
    let document = if settings.tools.enabled {
        match ToolServerDocument::load(&settings.tools.servers_file) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(error = %e, "no tool-server document; starting without tools");
                ToolServerDocument::default()
            }
        }
    } else {
        tracing::info!("tool servers disabled by configuration");
        ToolServerDocument::default()
    };
    let registry = Arc::new(ToolRegistry::from_document(
        &document,
        Duration::from_secs(settings.tools.call_timeout_seconds),
    ));
    registry.refresh_all().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    registry.spawn_refresh_tasks(shutdown_rx);

    // Stores and caches
    let store = Arc::new(MemoryConversationStore::new());
    let feedback = Arc::new(MemoryFeedbackStore::new());
    let counts = Arc::new(CountCache::new(Duration::from_secs(
        settings.feedback.count_cache_ttl_seconds,
    )));
    let directory = Arc::new(CachedDirectory::new(Arc::new(MemoryDirectory::new())));

    // Output routing
    let connections = Arc::new(ConnectionRegistry::new());
    let audio_cache = Arc::new(AudioCache::new(Duration::from_secs(
        settings.output.audio_cache_ttl_seconds,
    )));
    let output = Arc::new(OutputRouter::new(
        Arc::new(OfflineMediaPlayer),
        Arc::clone(&connections) as Arc<dyn hearth_output::DeviceSink>,
        Arc::clone(&audio_cache),
        OutputRouterConfig {
            advertise_host: settings.output.advertise_host.clone(),
            advertise_port: settings.output.advertise_port,
            prefer_external_sink: settings.output.prefer_external_sink,
        },
    ));

    let deps = PipelineDeps {
        store,
        feedback,
        counts,
        llm,
        registry,
        retriever: Arc::new(NullRetriever),
        tts: None,
        stt: None,
        directory,
        output,
    };
    let state = AppState::new(settings.clone(), deps, Arc::clone(&connections), audio_cache);

    let app = create_router(state);
    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("parsing bind address")?;
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await.context("binding listener")?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            connections.close_all("shutdown").await;
        })
        .await
        .context("serving")?;

    Ok(())
}

//! HTTP endpoints
//!
//! REST fallbacks for clients that cannot hold a socket, session and
//! feedback administration, cached-audio serving for external media
//! players, and health/metrics.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use hearth_core::{
    allow_all, ConversationStore, Correction, FeedbackScope, FeedbackStore, LanguageModel,
};

use crate::connection::{Connection, PipelineState};
use crate::metrics::metrics_handler;
use crate::protocol::ServerMessage;
use crate::state::AppState;
use crate::ws::{chat_ws_handler, device_ws_handler};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors_layer =
        build_cors_layer(&state.settings.server.cors_origins, state.settings.server.cors_enabled);

    Router::new()
        // WebSocket endpoints
        .route("/ws/chat", get(chat_ws_handler))
        .route("/ws/device", get(device_ws_handler))
        // REST fallback
        .route("/api/chat", post(rest_chat))
        // Administration
        .route("/api/sessions", get(session_stats))
        .route("/api/sessions/:id", delete(delete_session))
        .route("/api/tools", get(list_tools))
        .route("/api/feedback", post(save_feedback))
        .route("/api/config/push", post(push_config))
        // Cached audio for external media players
        .route("/audio/:id", get(serve_audio))
        // Health
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        tracing::warn!("CORS disabled; allowing all origins");
        return CorsLayer::permissive();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "invalid CORS origin ignored");
                None
            }
        })
        .collect();

    if parsed.is_empty() {
        return CorsLayer::new()
            .allow_origin("http://localhost:3000".parse::<HeaderValue>().expect("static origin"))
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any);
    }

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

#[derive(Debug, Deserialize)]
struct RestChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    use_rag: bool,
    #[serde(default)]
    knowledge_base_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct RestChatResponse {
    response: String,
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_steps: Option<u32>,
    tts_handled: bool,
}

/// Single-shot chat: runs the same pipeline without streaming.
async fn rest_chat(
    State(state): State<AppState>,
    Json(request): Json<RestChatRequest>,
) -> Result<Json<RestChatResponse>, StatusCode> {
    let session_id =
        request.session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    crate::metrics::record_utterance("rest");

    // an ephemeral connection collects the frames the pipeline emits;
    // a concurrent collector keeps the stream from backing up
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(64);
    let conn = Arc::new(Connection::new(tx, None, allow_all(), PipelineState::Idle, false));

    let collector = tokio::spawn(async move {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    });

    state
        .pipeline
        .handle_text(
            &conn,
            &session_id,
            &request.message,
            request.use_rag,
            request.knowledge_base_id.as_deref(),
            state.settings.session.tail_size_chat,
        )
        .await;
    drop(conn);

    let frames = collector.await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let mut response = String::new();
    let mut intent = None;
    let mut agent_steps = None;
    let mut tts_handled = false;
    for frame in frames {
        match frame {
            ServerMessage::Stream { content } => response.push_str(&content),
            ServerMessage::Action { intent: label, .. } => intent = Some(label),
            ServerMessage::Done { tts_handled: handled, agent_steps: steps } => {
                tts_handled = handled;
                agent_steps = steps;
            }
            _ => {}
        }
    }

    Ok(Json(RestChatResponse { response, session_id, intent, agent_steps, tts_handled }))
}

async fn session_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let stats = state
        .store
        .stats()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({
        "sessions": stats.sessions,
        "messages": stats.messages,
        "connections": state.connections.len(),
    })))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    match state.store.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            tracing::warn!(session = id, error = %e, "session delete failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn list_tools(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tools: Vec<serde_json::Value> = state
        .registry
        .list_all()
        .into_iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "prompt_included": t.prompt_included,
            })
        })
        .collect();
    Json(serde_json::json!({ "tools": tools }))
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    scope: FeedbackScope,
    query: String,
    wrong_label: String,
    right_label: String,
}

/// Record a correction (the UI's thumbs-down path).
async fn save_feedback(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<StatusCode, StatusCode> {
    let embedding = state
        .llm
        .embed(&request.query)
        .await
        .map_err(|_| StatusCode::BAD_GATEWAY)?;

    let correction = Correction::new(
        request.scope,
        request.query,
        embedding,
        request.wrong_label,
        request.right_label,
    );
    state
        .feedback
        .save(correction)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state.counts.invalidate(request.scope);
    Ok(StatusCode::CREATED)
}

/// Push a configuration document to every registered device.
async fn push_config(
    State(state): State<AppState>,
    Json(config): Json<serde_json::Value>,
) -> StatusCode {
    state.connections.broadcast_config(config).await;
    StatusCode::ACCEPTED
}

async fn serve_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let clip = state.audio_cache.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(([(header::CONTENT_TYPE, clip.mime_type)], clip.data))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ready",
        "connections": state.connections.len(),
        "tools": state.registry.list_all().len(),
    }))
}

//! WebSocket endpoints
//!
//! Two endpoints share one message vocabulary: `/ws/chat` for browser
//! panels (no registration, starts idle) and `/ws/device` for satellites
//! and wall panels (mandatory `register` first frame, audio framing,
//! heartbeats). One task per connection owns inbound demultiplexing;
//! pipeline work runs as a child task so heartbeats keep flowing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use hearth_core::{allow_all, satellite_session_id_today, Capabilities, DeviceKind, DeviceRecord};

use crate::connection::{Connection, PipelineState};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::rate_limit::TokenBucket;
use crate::state::AppState;
use crate::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Chat,
    Device,
}

/// `GET /ws/chat`
pub async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer, Endpoint::Chat))
}

/// `GET /ws/device`
pub async fn device_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer, Endpoint::Device))
}

async fn handle_socket(socket: WebSocket, state: AppState, peer: SocketAddr, endpoint: Endpoint) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(64);
    let initial_state = match endpoint {
        Endpoint::Chat => PipelineState::Idle,
        Endpoint::Device => PipelineState::Unregistered,
    };
    let conn = Arc::new(Connection::new(
        outbound_tx,
        Some(peer.ip().to_string()),
        allow_all(),
        initial_state,
        endpoint == Endpoint::Device,
    ));
    state.connections.insert(Arc::clone(&conn));
    tracing::info!(connection = %conn.id, %peer, ?endpoint, "connection accepted");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // outbound pump: serializes frames in order, honors transport backpressure
    let pump_conn = Arc::clone(&conn);
    let pump = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let payload = match serde_json::to_string(&message) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = %e, "outbound serialization failed");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(payload)).await.is_err() {
                pump_conn.begin_close();
                break;
            }
        }
    });

    // heartbeat watchdog (device endpoint only)
    let watchdog = if endpoint == Endpoint::Device {
        let grace = Duration::from_secs(state.settings.connection.heartbeat_grace_seconds);
        let watch_conn = Arc::clone(&conn);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(grace / 3);
            loop {
                ticker.tick().await;
                if watch_conn.cancel.is_cancelled() {
                    break;
                }
                if watch_conn.heartbeat_expired(grace) {
                    tracing::info!(connection = %watch_conn.id, "heartbeat grace expired");
                    let _ = watch_conn
                        .send(ServerMessage::Error { message: "heartbeat timeout".to_string() })
                        .await;
                    watch_conn.begin_close();
                    break;
                }
            }
        }))
    } else {
        None
    };

    let bucket = TokenBucket::new(
        state.settings.connection.rate_limit_per_connection,
        state.settings.connection.rate_limit_burst,
    );

    loop {
        let frame = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let message = match frame {
            Some(Ok(Message::Text(payload))) => {
                match serde_json::from_str::<ClientMessage>(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        let _ = conn
                            .send(ServerMessage::Error { message: format!("bad frame: {e}") })
                            .await;
                        continue;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(connection = %conn.id, error = %e, "transport error");
                break;
            }
        };

        // dropped messages never advance state
        if !bucket.try_acquire() {
            let _ = conn
                .send(ServerMessage::Error { message: "rate limit exceeded".to_string() })
                .await;
            continue;
        }

        dispatch(&state, &conn, endpoint, message).await;
    }

    // transport closed: cancel in-flight work, release resources
    conn.begin_close();
    state.connections.remove(&conn);
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    pump.abort();
    tracing::info!(connection = %conn.id, "connection closed");
}

async fn dispatch(state: &AppState, conn: &Arc<Connection>, endpoint: Endpoint, message: ClientMessage) {
    match message {
        ClientMessage::Register { device_id, device_kind, room, capabilities, stationary } => {
            if endpoint != Endpoint::Device {
                let _ = conn
                    .send(ServerMessage::Error {
                        message: "register is only valid on the device endpoint".to_string(),
                    })
                    .await;
                return;
            }
            if let Err(e) =
                handle_register(state, conn, device_id, device_kind, room, capabilities, stationary)
                    .await
            {
                tracing::warn!(connection = %conn.id, error = %e, "registration failed");
                let _ = conn
                    .send(ServerMessage::Error { message: format!("registration failed: {e}") })
                    .await;
                conn.begin_close();
            }
        }

        ClientMessage::Heartbeat { .. } => {
            conn.touch_heartbeat();
            let _ = conn.send(ServerMessage::HeartbeatAck).await;
        }

        ClientMessage::Text { content, session_id, use_rag, knowledge_base_id } => {
            if conn.state() == PipelineState::Unregistered {
                let _ = conn
                    .send(ServerMessage::Error { message: "register first".to_string() })
                    .await;
                return;
            }
            if !matches!(conn.state(), PipelineState::Idle) {
                let _ = conn
                    .send(ServerMessage::Error { message: "pipeline busy".to_string() })
                    .await;
                return;
            }
            let session_id = resolve_session(conn, session_id);
            *conn.session_id.write() = Some(session_id.clone());
            crate::metrics::record_utterance(match endpoint {
                Endpoint::Chat => "chat",
                Endpoint::Device => "device",
            });

            let tail_size = tail_size_for(state, conn, endpoint);
            let pipeline = Arc::clone(&state.pipeline);
            let conn = Arc::clone(conn);
            tokio::spawn(async move {
                pipeline
                    .handle_text(&conn, &session_id, &content, use_rag, knowledge_base_id.as_deref(), tail_size)
                    .await;
            });
        }

        ClientMessage::Audio { chunk, sequence, session_id } => {
            if endpoint != Endpoint::Device {
                return;
            }
            if conn.state() == PipelineState::Idle {
                let _ = conn.transition(PipelineState::ReceivingAudio).await;
                *conn.session_id.write() = Some(session_id);
            }
            match base64::engine::general_purpose::STANDARD.decode(chunk.as_bytes()) {
                Ok(bytes) => conn.audio_buffer.lock().extend_from_slice(&bytes),
                Err(e) => {
                    tracing::debug!(sequence, error = %e, "undecodable audio chunk dropped");
                }
            }
        }

        ClientMessage::AudioEnd { session_id, reason } => {
            if endpoint != Endpoint::Device {
                return;
            }
            tracing::debug!(connection = %conn.id, ?reason, "audio end");
            let audio: Vec<u8> = std::mem::take(&mut *conn.audio_buffer.lock());
            let Some(stt) = state.pipeline.stt.clone() else {
                let _ = conn
                    .send(ServerMessage::Error { message: "no speech-to-text engine".to_string() })
                    .await;
                let _ = conn.transition(PipelineState::Processing).await;
                let _ = conn.transition(PipelineState::Idle).await;
                return;
            };

            let session_id = resolve_session(conn, Some(session_id));
            let tail_size = tail_size_for(state, conn, endpoint);
            let pipeline = Arc::clone(&state.pipeline);
            let conn = Arc::clone(conn);
            tokio::spawn(async move {
                let text = match stt.transcribe(&audio).await {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "transcription failed");
                        let _ = conn
                            .send(ServerMessage::Error { message: "transcription failed".to_string() })
                            .await;
                        let _ = conn.transition(PipelineState::Processing).await;
                        let _ = conn.transition(PipelineState::Idle).await;
                        return;
                    }
                };
                let _ = conn
                    .send(ServerMessage::Transcription {
                        text: text.clone(),
                        session_id: session_id.clone(),
                    })
                    .await;
                pipeline.handle_text(&conn, &session_id, &text, false, None, tail_size).await;
            });
        }

        ClientMessage::WakewordDetected { keyword, confidence, session_id } => {
            tracing::debug!(connection = %conn.id, keyword, confidence, "wake word");
            if let Some(session_id) = session_id {
                *conn.session_id.write() = Some(session_id);
            }
            if conn.state() == PipelineState::Idle {
                let _ = conn.transition(PipelineState::ReceivingAudio).await;
            }
        }

        ClientMessage::StartSession {} => {
            let session_id = fresh_session(conn);
            tracing::debug!(connection = %conn.id, session_id, "session started");
            *conn.session_id.write() = Some(session_id);
        }
    }
}

async fn handle_register(
    state: &AppState,
    conn: &Arc<Connection>,
    device_id: String,
    device_kind: DeviceKind,
    room: Option<String>,
    capabilities: Capabilities,
    stationary: bool,
) -> Result<(), ServerError> {
    // room binding: declared name first, then network identity for
    // stationary devices
    let room_id = if let Some(name) = &room {
        state
            .pipeline_directory()
            .room_by_name(name)
            .await
            .map_err(|e| ServerError::Registration(e.to_string()))?
            .map(|r| r.id)
    } else if stationary {
        match &conn.peer {
            Some(identity) => state
                .pipeline_directory()
                .device_by_network(identity)
                .await
                .map_err(|e| ServerError::Registration(e.to_string()))?
                .and_then(|d| d.room_id),
            None => None,
        }
    } else {
        None
    };

    let record = DeviceRecord {
        id: device_id.clone(),
        kind: device_kind,
        capabilities: capabilities.clone(),
        network_identity: conn.peer.clone(),
        room_id: room_id.clone(),
    };
    state
        .pipeline_directory()
        .upsert_device(record)
        .await
        .map_err(|e| ServerError::Registration(e.to_string()))?;

    *conn.device_id.write() = Some(device_id.clone());
    *conn.kind.write() = Some(device_kind);
    *conn.capabilities.write() = capabilities.clone();
    *conn.room_id.write() = room_id.clone();
    state.connections.bind_device(&device_id, Arc::clone(conn));

    conn.transition(PipelineState::Idle).await?;
    conn.send(ServerMessage::RegisterAck {
        success: true,
        device_id,
        room_id,
        capabilities,
    })
    .await?;
    Ok(())
}

/// Sessions survive reconnection: a supplied identifier is used as-is;
/// satellites default to their daily derived session, everything else gets
/// a fresh opaque id.
fn resolve_session(conn: &Connection, supplied: Option<String>) -> String {
    if let Some(session_id) = supplied {
        return session_id;
    }
    if let Some(session_id) = conn.session_id.read().clone() {
        return session_id;
    }
    fresh_session(conn)
}

fn fresh_session(conn: &Connection) -> String {
    let kind = *conn.kind.read();
    if kind == Some(DeviceKind::Satellite) {
        if let Some(device_id) = conn.device_id.read().clone() {
            return satellite_session_id_today(&device_id);
        }
    }
    uuid::Uuid::new_v4().to_string()
}

fn tail_size_for(state: &AppState, conn: &Connection, endpoint: Endpoint) -> usize {
    match (endpoint, *conn.kind.read()) {
        (_, Some(DeviceKind::Satellite)) => state.settings.session.tail_size_satellite,
        (Endpoint::Chat, _) | (Endpoint::Device, _) => state.settings.session.tail_size_ws,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with_kind(kind: Option<DeviceKind>, device_id: Option<&str>) -> Connection {
        let (tx, _rx) = mpsc::channel(4);
        let conn = Connection::new(tx, None, allow_all(), PipelineState::Idle, false);
        *conn.kind.write() = kind;
        *conn.device_id.write() = device_id.map(String::from);
        conn
    }

    #[test]
    fn test_supplied_session_wins() {
        let conn = conn_with_kind(Some(DeviceKind::Satellite), Some("sat-1"));
        assert_eq!(resolve_session(&conn, Some("explicit".to_string())), "explicit");
    }

    #[test]
    fn test_satellite_session_is_daily_derived() {
        let conn = conn_with_kind(Some(DeviceKind::Satellite), Some("sat-1"));
        let id = resolve_session(&conn, None);
        assert!(id.starts_with("satellite-sat-1-"));
    }

    #[test]
    fn test_non_satellite_gets_opaque_session() {
        let conn = conn_with_kind(Some(DeviceKind::Mobile), Some("phone-1"));
        let id = resolve_session(&conn, None);
        assert!(!id.starts_with("satellite-"));
    }

    #[test]
    fn test_sticky_session_reused() {
        let conn = conn_with_kind(None, None);
        *conn.session_id.write() = Some("s7".to_string());
        assert_eq!(resolve_session(&conn, None), "s7");
    }
}

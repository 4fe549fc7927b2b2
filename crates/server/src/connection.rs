//! Per-connection state
//!
//! A `Connection` is one live transport attachment; it never outlives its
//! transport. The pipeline state machine gates what the connection may do
//! next, and every state change can be observed by device clients.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hearth_core::{AudioClip, Capabilities, DeviceKind, PermissionPredicate};
use hearth_output::{DeviceSink, OutputError};

use crate::protocol::ServerMessage;
use crate::ServerError;

/// Base64 payload bytes per tts_audio frame
const AUDIO_CHUNK_BYTES: usize = 32 * 1024;

/// Pipeline states per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineState {
    Unregistered,
    Idle,
    ReceivingAudio,
    Processing,
    Streaming,
    Closing,
}

impl PipelineState {
    /// The transition graph; `Closing` is reachable from everywhere and
    /// terminal.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (_, Closing) => self != Closing,
            (Unregistered, Idle) => true,
            (Idle, ReceivingAudio) | (Idle, Processing) => true,
            (ReceivingAudio, Processing) => true,
            (Processing, Streaming) => true,
            // error recovery: a failed exchange returns to idle
            (Processing, Idle) => true,
            (Streaming, Idle) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Unregistered => "unregistered",
            PipelineState::Idle => "idle",
            PipelineState::ReceivingAudio => "receiving-audio",
            PipelineState::Processing => "processing",
            PipelineState::Streaming => "streaming",
            PipelineState::Closing => "closing",
        };
        write!(f, "{name}")
    }
}

/// One live transport attachment
pub struct Connection {
    /// Connection id (not the device id)
    pub id: String,
    /// Peer network identity, when the transport exposes one
    pub peer: Option<String>,
    /// Set on successful registration
    pub device_id: RwLock<Option<String>>,
    pub kind: RwLock<Option<DeviceKind>>,
    pub capabilities: RwLock<Capabilities>,
    pub room_id: RwLock<Option<String>>,
    /// Active session for this connection
    pub session_id: RwLock<Option<String>>,
    pub permission: PermissionPredicate,
    state: RwLock<PipelineState>,
    /// Emit state-change frames to the client (device endpoint)
    emit_state_frames: bool,
    outbound: mpsc::Sender<ServerMessage>,
    /// Tripped on transport close; children derive from it
    pub cancel: CancellationToken,
    last_heartbeat: RwLock<Instant>,
    /// Buffered utterance audio while receiving
    pub audio_buffer: Mutex<Vec<u8>>,
}

impl Connection {
    pub fn new(
        outbound: mpsc::Sender<ServerMessage>,
        peer: Option<String>,
        permission: PermissionPredicate,
        initial_state: PipelineState,
        emit_state_frames: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer,
            device_id: RwLock::new(None),
            kind: RwLock::new(None),
            capabilities: RwLock::new(Capabilities::default()),
            room_id: RwLock::new(None),
            session_id: RwLock::new(None),
            permission,
            state: RwLock::new(initial_state),
            emit_state_frames,
            outbound,
            cancel: CancellationToken::new(),
            last_heartbeat: RwLock::new(Instant::now()),
            audio_buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    /// Device-endpoint connections observe state changes and receive the
    /// device-only frames (response_text, config_update).
    pub fn is_device(&self) -> bool {
        self.emit_state_frames
    }

    /// Advance the state machine; invalid transitions are refused.
    pub async fn transition(&self, next: PipelineState) -> Result<(), ServerError> {
        {
            let mut state = self.state.write();
            if !state.can_transition_to(next) {
                return Err(ServerError::InvalidTransition(*state, next));
            }
            if *state == next {
                return Ok(());
            }
            tracing::debug!(connection = %self.id, from = %state, to = %next, "state transition");
            *state = next;
        }
        if self.emit_state_frames {
            let _ = self.send(ServerMessage::State { state: next }).await;
        }
        Ok(())
    }

    /// Queue an outbound frame; suspends under transport backpressure.
    pub async fn send(&self, message: ServerMessage) -> Result<(), ServerError> {
        self.outbound.send(message).await.map_err(|_| ServerError::ConnectionClosed)
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.write() = Instant::now();
    }

    pub fn heartbeat_expired(&self, grace: Duration) -> bool {
        self.last_heartbeat.read().elapsed() > grace
    }

    /// Trip cancellation and advance to closing.
    pub fn begin_close(&self) {
        let mut state = self.state.write();
        if *state != PipelineState::Closing {
            tracing::debug!(connection = %self.id, "closing connection");
            *state = PipelineState::Closing;
            self.cancel.cancel();
        }
    }
}

/// The set of live connections, indexed by connection and device id.
///
/// Doubles as the output router's internal-device sink.
#[derive(Default)]
pub struct ConnectionRegistry {
    by_id: DashMap<String, Arc<Connection>>,
    by_device: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.by_id.insert(conn.id.clone(), conn);
    }

    /// Bind a registered device id to its connection.
    pub fn bind_device(&self, device_id: &str, conn: Arc<Connection>) {
        self.by_device.insert(device_id.to_string(), conn);
    }

    pub fn remove(&self, conn: &Connection) {
        self.by_id.remove(&conn.id);
        if let Some(device_id) = conn.device_id.read().clone() {
            // only unbind if this connection still owns the device
            if let Some(existing) = self.by_device.get(&device_id) {
                if existing.id == conn.id {
                    drop(existing);
                    self.by_device.remove(&device_id);
                }
            }
        }
    }

    pub fn get_by_device(&self, device_id: &str) -> Option<Arc<Connection>> {
        self.by_device.get(device_id).map(|c| Arc::clone(&c))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Push a configuration update to every device connection.
    pub async fn broadcast_config(&self, config: serde_json::Value) {
        let connections: Vec<Arc<Connection>> =
            self.by_id.iter().map(|entry| Arc::clone(entry.value())).collect();
        for conn in connections {
            if conn.is_device() {
                let _ = conn.send(ServerMessage::ConfigUpdate { config: config.clone() }).await;
            }
        }
    }

    /// Close every connection (graceful shutdown).
    pub async fn close_all(&self, reason: &str) {
        let connections: Vec<Arc<Connection>> =
            self.by_id.iter().map(|entry| Arc::clone(entry.value())).collect();
        for conn in connections {
            let session_id = conn.session_id.read().clone();
            if let Some(session_id) = session_id {
                let _ = conn
                    .send(ServerMessage::SessionEnd {
                        session_id,
                        reason: reason.to_string(),
                    })
                    .await;
            }
            conn.begin_close();
        }
    }
}

#[async_trait]
impl DeviceSink for ConnectionRegistry {
    fn is_connected(&self, device_id: &str) -> bool {
        self.by_device.contains_key(device_id)
    }

    async fn push_audio(
        &self,
        device_id: &str,
        clip: &AudioClip,
        session_id: &str,
    ) -> Result<(), OutputError> {
        let conn = self
            .get_by_device(device_id)
            .ok_or_else(|| OutputError::Delivery(format!("device {device_id} not connected")))?;

        let engine = base64::engine::general_purpose::STANDARD;
        let chunks: Vec<&[u8]> = clip.data.chunks(AUDIO_CHUNK_BYTES).collect();
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            conn.send(ServerMessage::TtsAudio {
                audio: engine.encode(chunk),
                is_final: i == last,
                session_id: session_id.to_string(),
            })
            .await
            .map_err(|e| OutputError::Delivery(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::allow_all;

    fn connection() -> (Arc<Connection>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(Connection::new(
            tx,
            None,
            allow_all(),
            PipelineState::Unregistered,
            true,
        ));
        (conn, rx)
    }

    #[tokio::test]
    async fn test_legal_transitions() {
        let (conn, mut rx) = connection();
        conn.transition(PipelineState::Idle).await.unwrap();
        conn.transition(PipelineState::ReceivingAudio).await.unwrap();
        conn.transition(PipelineState::Processing).await.unwrap();
        conn.transition(PipelineState::Streaming).await.unwrap();
        conn.transition(PipelineState::Idle).await.unwrap();

        // device endpoint observes each change
        let mut observed = Vec::new();
        while let Ok(ServerMessage::State { state }) = rx.try_recv() {
            observed.push(state);
        }
        assert_eq!(
            observed,
            vec![
                PipelineState::Idle,
                PipelineState::ReceivingAudio,
                PipelineState::Processing,
                PipelineState::Streaming,
                PipelineState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_illegal_transitions_refused() {
        let (conn, _rx) = connection();
        assert!(conn.transition(PipelineState::Streaming).await.is_err());
        conn.transition(PipelineState::Idle).await.unwrap();
        assert!(conn.transition(PipelineState::Streaming).await.is_err());
        assert_eq!(conn.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_closing_from_anywhere_and_terminal() {
        let (conn, _rx) = connection();
        conn.transition(PipelineState::Closing).await.unwrap();
        assert!(conn.transition(PipelineState::Idle).await.is_err());
    }

    #[tokio::test]
    async fn test_begin_close_cancels() {
        let (conn, _rx) = connection();
        assert!(!conn.cancel.is_cancelled());
        conn.begin_close();
        assert!(conn.cancel.is_cancelled());
        assert_eq!(conn.state(), PipelineState::Closing);
    }

    #[test]
    fn test_heartbeat_expiry() {
        let (tx, _rx) = mpsc::channel(1);
        let conn =
            Connection::new(tx, None, allow_all(), PipelineState::Unregistered, false);
        assert!(!conn.heartbeat_expired(Duration::from_secs(60)));
        assert!(conn.heartbeat_expired(Duration::from_nanos(1)));
        conn.touch_heartbeat();
        assert!(!conn.heartbeat_expired(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_registry_device_binding() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection();
        *conn.device_id.write() = Some("sat-1".to_string());
        registry.insert(Arc::clone(&conn));
        registry.bind_device("sat-1", Arc::clone(&conn));

        assert!(registry.is_connected("sat-1"));
        assert!(!registry.is_connected("sat-2"));

        registry.remove(&conn);
        assert!(!registry.is_connected("sat-1"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_push_audio_chunks_with_final_flag() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(64);
        let conn = Arc::new(Connection::new(
            tx,
            None,
            allow_all(),
            PipelineState::Idle,
            false,
        ));
        *conn.device_id.write() = Some("sat-1".to_string());
        registry.insert(Arc::clone(&conn));
        registry.bind_device("sat-1", conn);

        let clip = AudioClip {
            data: vec![0u8; AUDIO_CHUNK_BYTES + 10],
            mime_type: "audio/wav".to_string(),
            sample_rate: 22050,
        };
        registry.push_audio("sat-1", &clip, "s1").await.unwrap();

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 2);
        match (&frames[0], &frames[1]) {
            (
                ServerMessage::TtsAudio { is_final: first, .. },
                ServerMessage::TtsAudio { is_final: last, .. },
            ) => {
                assert!(!first);
                assert!(last);
            }
            other => panic!("unexpected frames {other:?}"),
        }
    }
}

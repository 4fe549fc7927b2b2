//! Client wire protocol
//!
//! One structured message per transport frame, `type` as discriminator.
//! The chat and device endpoints share the vocabulary; registration and
//! audio framing only occur on the device endpoint.

use serde::{Deserialize, Serialize};

use hearth_core::{Capabilities, DeviceKind};

use crate::connection::PipelineState;

/// Inbound messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Mandatory first frame on the device endpoint
    Register {
        device_id: String,
        device_kind: DeviceKind,
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        capabilities: Capabilities,
        #[serde(default)]
        stationary: bool,
    },
    Heartbeat {
        #[serde(default)]
        status: Option<String>,
    },
    Text {
        content: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        use_rag: bool,
        #[serde(default)]
        knowledge_base_id: Option<String>,
    },
    Audio {
        /// Base64 payload
        chunk: String,
        sequence: u32,
        session_id: String,
    },
    AudioEnd {
        session_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    WakewordDetected {
        keyword: String,
        confidence: f32,
        #[serde(default)]
        session_id: Option<String>,
    },
    StartSession {},
}

/// Outbound messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RegisterAck {
        success: bool,
        device_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        capabilities: Capabilities,
    },
    /// Pipeline state change on the device endpoint
    State {
        state: PipelineState,
    },
    Transcription {
        text: String,
        session_id: String,
    },
    /// A resolved intent and its tool result
    Action {
        intent: String,
        result: serde_json::Value,
    },
    /// One chunk of the streamed reply
    Stream {
        content: String,
    },
    AgentThinking {
        session_id: String,
        step: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    AgentToolCall {
        session_id: String,
        step: u32,
        name: String,
        params: serde_json::Value,
        reason: String,
    },
    AgentToolResult {
        session_id: String,
        step: u32,
        name: String,
        success: bool,
        result: serde_json::Value,
    },
    ResponseText {
        text: String,
        session_id: String,
    },
    TtsAudio {
        /// Base64 chunk
        audio: String,
        is_final: bool,
        session_id: String,
    },
    SessionEnd {
        session_id: String,
        reason: String,
    },
    HeartbeatAck,
    ConfigUpdate {
        config: serde_json::Value,
    },
    /// Terminal frame of a reply
    Done {
        tts_handled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_steps: Option<u32>,
    },
    Error {
        message: String,
    },
}

impl From<hearth_agent::AgentEvent> for ServerMessage {
    fn from(event: hearth_agent::AgentEvent) -> Self {
        use hearth_agent::AgentEventKind;
        match event.kind {
            AgentEventKind::Thinking { note } => ServerMessage::AgentThinking {
                session_id: event.session_id,
                step: event.step,
                note,
            },
            AgentEventKind::ToolCall { name, params, reason } => ServerMessage::AgentToolCall {
                session_id: event.session_id,
                step: event.step,
                name,
                params,
                reason,
            },
            AgentEventKind::ToolResult { name, success, result } => {
                ServerMessage::AgentToolResult {
                    session_id: event.session_id,
                    step: event.step,
                    name,
                    success,
                    result,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_discriminator() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "text",
            "content": "Turn on the lamp in the office.",
            "session_id": "s1"
        }))
        .unwrap();
        match msg {
            ClientMessage::Text { content, session_id, use_rag, .. } => {
                assert_eq!(content, "Turn on the lamp in the office.");
                assert_eq!(session_id.as_deref(), Some("s1"));
                assert!(!use_rag);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_register_frame() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "register",
            "device_id": "sat-1",
            "device_kind": "satellite",
            "room": "Kitchen",
            "capabilities": {"microphone": true, "speaker": true, "wake_word": true},
            "stationary": true
        }))
        .unwrap();
        match msg {
            ClientMessage::Register { device_id, device_kind, room, capabilities, stationary } => {
                assert_eq!(device_id, "sat-1");
                assert_eq!(device_kind, DeviceKind::Satellite);
                assert_eq!(room.as_deref(), Some("Kitchen"));
                assert!(capabilities.speaker);
                assert!(stationary);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_outbound_done_frame() {
        let json = serde_json::to_value(ServerMessage::Done {
            tts_handled: false,
            agent_steps: Some(2),
        })
        .unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["tts_handled"], false);
        assert_eq!(json["agent_steps"], 2);

        let json = serde_json::to_value(ServerMessage::Done {
            tts_handled: true,
            agent_steps: None,
        })
        .unwrap();
        assert!(json.get("agent_steps").is_none());
    }

    #[test]
    fn test_agent_event_conversion() {
        let event = hearth_agent::AgentEvent::new(
            "s4",
            1,
            hearth_agent::AgentEventKind::ToolCall {
                name: "weather.current".to_string(),
                params: json!({"city": "Berlin"}),
                reason: "forecast".to_string(),
            },
        );
        let msg: ServerMessage = event.into();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "agent_tool_call");
        assert_eq!(json["step"], 1);
    }
}

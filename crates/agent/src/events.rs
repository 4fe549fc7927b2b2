//! Typed agent events
//!
//! Emitted to the session router interleaved with the final answer's
//! stream chunks. Every event carries the session identifier and a
//! monotonically increasing step index.

use serde::{Deserialize, Serialize};

/// What happened at a step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEventKind {
    /// The model is reasoning before its next move
    Thinking {
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// A tool is about to be invoked
    ToolCall {
        name: String,
        params: serde_json::Value,
        reason: String,
    },
    /// A tool call finished
    ToolResult {
        name: String,
        success: bool,
        result: serde_json::Value,
    },
}

/// One agent event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub session_id: String,
    pub step: u32,
    #[serde(flatten)]
    pub kind: AgentEventKind,
}

impl AgentEvent {
    pub fn new(session_id: impl Into<String>, step: u32, kind: AgentEventKind) -> Self {
        Self { session_id: session_id.into(), step, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = AgentEvent::new(
            "s4",
            1,
            AgentEventKind::ToolCall {
                name: "weather.current".to_string(),
                params: json!({"city": "Berlin"}),
                reason: "need the forecast first".to_string(),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["session_id"], "s4");
        assert_eq!(value["step"], 1);
        assert_eq!(value["kind"], "tool_call");
        assert_eq!(value["params"]["city"], "Berlin");
    }
}

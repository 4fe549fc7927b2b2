//! Devices, rooms and output sink bindings

use serde::{Deserialize, Serialize};

/// Nominal device kind declared at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Hardware satellite with wake-word support
    Satellite,
    /// Stationary wall panel
    Panel,
    /// Mobile browser
    Mobile,
    /// Desktop browser
    Desktop,
}

impl DeviceKind {
    /// Stationary devices can be room-bound by network identity alone
    pub fn is_stationary(&self) -> bool {
        matches!(self, DeviceKind::Satellite | DeviceKind::Panel)
    }
}

/// Capabilities a device declares at registration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub microphone: bool,
    #[serde(default)]
    pub speaker: bool,
    #[serde(default)]
    pub wake_word: bool,
    /// Display size as (width, height) in pixels, when a display exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<(u32, u32)>,
}

/// A persistent logical device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Stable device identifier
    pub id: String,
    pub kind: DeviceKind,
    pub capabilities: Capabilities,
    /// Last-known peer network identity (for room auto-detection)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_identity: Option<String>,
    /// Owning room, when bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

/// Where a sink binding points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkRef {
    /// An internal device connected over our own transport
    Device { device_id: String },
    /// An external media-player entity driven via the media integration
    MediaPlayer { entity_id: String },
}

/// A (room, priority, sink, interruption, volume) tuple
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSinkBinding {
    /// Dense ordering within the room; ties broken by insertion order
    pub priority: u32,
    pub sink: SinkRef,
    /// Whether a busy sink may be interrupted for this binding
    #[serde(default)]
    pub allow_interrupt: bool,
    /// Playback volume in [0, 1]
    #[serde(default = "default_volume")]
    pub volume: f32,
}

fn default_volume() -> f32 {
    0.5
}

/// A room: stable id, human name, ordered sink bindings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sinks: Vec<OutputSinkBinding>,
}

impl Room {
    /// Sink bindings in ascending priority, insertion order preserved on ties
    pub fn ordered_sinks(&self) -> Vec<&OutputSinkBinding> {
        let mut sinks: Vec<&OutputSinkBinding> = self.sinks.iter().collect();
        sinks.sort_by_key(|b| b.priority);
        sinks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_ordering_stable_on_ties() {
        let room = Room {
            id: "kitchen".into(),
            name: "Kitchen".into(),
            sinks: vec![
                OutputSinkBinding {
                    priority: 2,
                    sink: SinkRef::Device { device_id: "d-late".into() },
                    allow_interrupt: false,
                    volume: 0.5,
                },
                OutputSinkBinding {
                    priority: 1,
                    sink: SinkRef::Device { device_id: "d-first".into() },
                    allow_interrupt: false,
                    volume: 0.5,
                },
                OutputSinkBinding {
                    priority: 1,
                    sink: SinkRef::MediaPlayer { entity_id: "media.kitchen".into() },
                    allow_interrupt: true,
                    volume: 0.5,
                },
            ],
        };

        let ordered = room.ordered_sinks();
        assert_eq!(ordered[0].sink, SinkRef::Device { device_id: "d-first".into() });
        assert_eq!(
            ordered[1].sink,
            SinkRef::MediaPlayer { entity_id: "media.kitchen".into() }
        );
        assert_eq!(ordered[2].sink, SinkRef::Device { device_id: "d-late".into() });
    }

    #[test]
    fn test_stationary_kinds() {
        assert!(DeviceKind::Satellite.is_stationary());
        assert!(DeviceKind::Panel.is_stationary());
        assert!(!DeviceKind::Mobile.is_stationary());
    }
}

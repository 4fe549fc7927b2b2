//! Sink selection and delivery

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use hearth_core::{AudioClip, MediaPlayer, PlayerState, Room, SinkRef};

use crate::audio_cache::AudioCache;
use crate::OutputError;

/// Internal-device delivery, implemented by the session router over its
/// live connection set.
#[async_trait]
pub trait DeviceSink: Send + Sync {
    /// Whether a live connection currently owns this device id.
    fn is_connected(&self, device_id: &str) -> bool;

    /// Push a synthesized clip to the device over its transport
    /// (chunked base64 frames).
    async fn push_audio(
        &self,
        device_id: &str,
        clip: &AudioClip,
        session_id: &str,
    ) -> Result<(), OutputError>;
}

/// The connection that submitted the utterance
#[derive(Debug, Clone, Default)]
pub struct InputDeviceRef {
    pub device_id: Option<String>,
    /// Declared `speaker` capability
    pub has_speaker: bool,
}

/// Where the reply's audio ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// An external media player is playing the cached URL
    ExternalPlayer { entity_id: String },
    /// Another internal device in the room received the audio
    InternalDevice { device_id: String },
    /// The originating connection plays it itself
    InputDevice,
    /// Produced but not delivered audibly; the text still streams
    NotDelivered,
}

impl Delivery {
    /// The `tts_handled` flag for the terminal reply frame: true when a
    /// sink other than the originating connection took the audio.
    pub fn tts_handled(&self) -> bool {
        matches!(self, Delivery::ExternalPlayer { .. } | Delivery::InternalDevice { .. })
    }
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct OutputRouterConfig {
    pub advertise_host: String,
    pub advertise_port: u16,
    /// When false and the input device can play, skip the binding walk
    /// and hand the audio straight back to the input device
    pub prefer_external_sink: bool,
}

impl Default for OutputRouterConfig {
    fn default() -> Self {
        Self {
            advertise_host: "127.0.0.1".to_string(),
            advertise_port: 8170,
            prefer_external_sink: true,
        }
    }
}

/// Picks a sink per room and delivers the audio
pub struct OutputRouter {
    media: Arc<dyn MediaPlayer>,
    devices: Arc<dyn DeviceSink>,
    cache: Arc<AudioCache>,
    config: OutputRouterConfig,
}

impl OutputRouter {
    pub fn new(
        media: Arc<dyn MediaPlayer>,
        devices: Arc<dyn DeviceSink>,
        cache: Arc<AudioCache>,
        config: OutputRouterConfig,
    ) -> Self {
        Self { media, devices, cache, config }
    }

    /// Walk the room's bindings and deliver `clip` to the first selectable
    /// sink; fall back to the input device when it declares a speaker.
    pub async fn deliver(
        &self,
        room: Option<&Room>,
        input: &InputDeviceRef,
        clip: &AudioClip,
        session_id: &str,
    ) -> Delivery {
        if !self.config.prefer_external_sink && input.has_speaker && input.device_id.is_some() {
            return Delivery::InputDevice;
        }

        if let Some(room) = room {
            for binding in room.ordered_sinks() {
                match &binding.sink {
                    SinkRef::Device { device_id } => {
                        if !self.devices.is_connected(device_id) {
                            continue;
                        }
                        if input.device_id.as_deref() == Some(device_id.as_str()) {
                            // the binding points back at the asker
                            return Delivery::InputDevice;
                        }
                        match self.devices.push_audio(device_id, clip, session_id).await {
                            Ok(()) => {
                                return Delivery::InternalDevice { device_id: device_id.clone() }
                            }
                            Err(e) => {
                                tracing::warn!(device_id, error = %e, "internal delivery failed");
                                continue;
                            }
                        }
                    }
                    SinkRef::MediaPlayer { entity_id } => {
                        let state = self
                            .media
                            .state(entity_id)
                            .await
                            .unwrap_or(PlayerState::Unreachable);
                        let selectable = state.is_available()
                            || (state.is_busy() && binding.allow_interrupt);
                        if !selectable {
                            continue;
                        }
                        match self.play_external(entity_id, clip, binding.volume).await {
                            Ok(()) => {
                                return Delivery::ExternalPlayer { entity_id: entity_id.clone() }
                            }
                            Err(e) => {
                                tracing::warn!(entity_id, error = %e, "external delivery failed");
                                continue;
                            }
                        }
                    }
                }
            }
        }

        if input.has_speaker && input.device_id.is_some() {
            return Delivery::InputDevice;
        }
        tracing::debug!(session_id, "no audible sink; text-only reply");
        Delivery::NotDelivered
    }

    /// Cache the clip and hand its URL to the media integration.
    async fn play_external(
        &self,
        entity_id: &str,
        clip: &AudioClip,
        volume: f32,
    ) -> Result<(), OutputError> {
        let id = self.cache.put(clip.clone());
        let url = format!(
            "http://{}:{}/audio/{}",
            self.config.advertise_host, self.config.advertise_port, id
        );
        self.media
            .play(entity_id, &url, volume)
            .await
            .map_err(|e| OutputError::Delivery(e.to_string()))
    }
}

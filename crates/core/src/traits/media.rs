//! External media player interface (used by the output router)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Reported state of an external media player entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Idle,
    Paused,
    Standby,
    Playing,
    Buffering,
    Off,
    Unreachable,
}

impl PlayerState {
    /// Idle, paused or standby players can take audio immediately.
    pub fn is_available(&self) -> bool {
        matches!(self, PlayerState::Idle | PlayerState::Paused | PlayerState::Standby)
    }

    /// Playing or buffering players need the interruption flag.
    pub fn is_busy(&self) -> bool {
        matches!(self, PlayerState::Playing | PlayerState::Buffering)
    }
}

/// Media integration collaborator
#[async_trait]
pub trait MediaPlayer: Send + Sync {
    async fn state(&self, entity_id: &str) -> Result<PlayerState>;

    /// Play the audio at `url` on the entity at the given volume.
    async fn play(&self, entity_id: &str, url: &str, volume: f32) -> Result<()>;
}

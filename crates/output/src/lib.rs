//! Output routing
//!
//! Picks one concrete audio sink per reply from the originating room's
//! priority-ordered bindings, honoring liveness and interruption policy,
//! and delivers: internal devices get chunked audio over their own
//! transport, external media players get a short-lived URL.

pub mod audio_cache;
pub mod router;

pub use audio_cache::AudioCache;
pub use router::{Delivery, DeviceSink, InputDeviceRef, OutputRouter, OutputRouterConfig};

use thiserror::Error;

/// Output routing errors
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("No audio cached under id {0}")]
    UnknownAudio(String),
}

impl From<OutputError> for hearth_core::Error {
    fn from(err: OutputError) -> Self {
        hearth_core::Error::Media(err.to_string())
    }
}

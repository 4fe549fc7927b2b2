//! Speech collaborator interfaces
//!
//! STT and TTS engines are external; the core only moves their bytes.

use async_trait::async_trait;

use crate::error::Result;

/// A synthesized utterance
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub sample_rate: u32,
}

/// Speech-to-text engine
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe a complete utterance.
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

/// Text-to-speech engine
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioClip>;
}

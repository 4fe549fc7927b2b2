//! Core types and traits for the assistant hub
//!
//! This crate provides the foundational vocabulary used across all other
//! crates:
//! - Conversation messages and per-message metadata
//! - Intent candidates (the classifier's output) as a sum type
//! - Devices, rooms and output sink bindings
//! - Session identifier rules
//! - Traits for external collaborators (LM, stores, retrieval, speech,
//!   media players, device directory)
//! - Error types

pub mod device;
pub mod error;
pub mod intent;
pub mod message;
pub mod session;
pub mod traits;

pub use device::{
    Capabilities, DeviceKind, DeviceRecord, OutputSinkBinding, Room, SinkRef,
};
pub use error::{Error, Result};
pub use intent::{CandidateAction, IntentCandidate, LocalCategory};
pub use message::{ConversationMessage, MessageMetadata, Role, SkippedCandidate};
pub use session::{satellite_session_id, satellite_session_id_today};

pub use traits::{
    allow_all,
    llm::{ChatMessage, ChatRole, LanguageModel, LlmOptions, LlmRole},
    media::{MediaPlayer, PlayerState},
    registry::DeviceDirectory,
    retriever::{Document, RetrievalBundle, Retriever},
    speech::{AudioClip, SpeechToText, TextToSpeech},
    store::{ConversationStore, Correction, FeedbackScope, FeedbackStore, StoreStats},
    PermissionPredicate,
};

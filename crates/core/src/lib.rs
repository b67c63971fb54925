//! Core traits and types for the voice session engine
//!
//! This crate provides foundational types used across all other crates:
//! - Audio frames and formats
//! - The closeable channel primitive used between pipeline stages
//! - Speech and transcript events
//! - Dialogue context
//! - Collaborator traits (VAD model, STT, TTS, language model, classifier)
//! - Error types and retry helpers

pub mod audio;
pub mod channel;
pub mod context;
pub mod error;
pub mod retry;
pub mod speech;
pub mod traits;

pub use audio::{rms_db, AudioEncoding, AudioFormat, AudioFrame, LinearResampler};
pub use channel::{channel, ChannelClosed, Receiver, Sender};
pub use context::{DialogueContext, DialogueItem, Role};
pub use error::{AudioError, Error, ProviderError, Result};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use speech::{SpeechData, SpeechEvent, SpeechEventKind};
pub use traits::{
    AudioStream, ChatDelta, ChatStream, ContextLookup, LanguageModel, SpeechToText, SttCapabilities,
    SttStream, TextToSpeech, ToolCallDelta, TtsCapabilities, TurnClassifier, TurnVerdict, VadModel,
};

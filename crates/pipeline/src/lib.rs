//! Recognition, turn-taking and synthesis pipeline
//!
//! This crate provides the per-connection processing stages:
//! - Voice activity detection stream (windowed, smoothed, padded)
//! - Speech-to-text streams, with a VAD-segmented adapter for batch engines
//! - Audio-recognition coordinator fusing VAD and STT
//! - Turn completion with classifier-assisted endpoint delay
//! - Interruption gate and cooperative abort flag
//! - TTS segmentation, prefetching synthesis and ordered delivery

pub mod endpointing;
pub mod interruption;
pub mod recognition;
pub mod stt;
pub mod tts;
pub mod vad;

// VAD exports
pub use vad::{EnergyVadModel, VadEvent, VadEventKind, VadModelFactory, VadOptions, VadProcessor, VadStream};

// STT exports
pub use stt::{open_recognition, StreamAdapter};

// Recognition exports
pub use recognition::{RecognitionCoordinator, RecognitionHandle, RecognitionHooks};

// Turn completion exports
pub use endpointing::{CommittedTurn, EndpointOptions, EvaluationRequest, TurnCompletion};

// Interruption exports
pub use interruption::{AbortFlag, BlockReason, InterruptionDecision, InterruptionDetector, InterruptionInput, InterruptionOptions};

// TTS exports
pub use tts::{
    PooledTts, ReplyHandle, SegmenterOptions, SynthesisConnection, SynthesisEvent, SynthesisOptions,
    SynthesisPipeline, TextInput, TextSegmenter, WarmConnector, WarmPool,
};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("VAD error: {0}")]
    Vad(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Turn detection error: {0}")]
    TurnDetection(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Not initialized")]
    NotInitialized,

    #[error(transparent)]
    Core(#[from] voice_session_core::Error),
}

impl From<voice_session_core::ChannelClosed> for PipelineError {
    fn from(_: voice_session_core::ChannelClosed) -> Self {
        PipelineError::ChannelClosed
    }
}

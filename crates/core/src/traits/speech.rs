//! Speech processing traits

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::audio::AudioFrame;
use crate::channel::{Receiver, Sender};
use crate::error::{Error, ProviderError};
use crate::speech::SpeechEvent;

/// Voice activity inference over fixed-size windows
pub trait VadModel: Send {
    /// Sample rate the model expects
    fn sample_rate(&self) -> u32;

    /// Samples per inference window
    fn window_size(&self) -> usize;

    /// Raw speech probability (0.0 - 1.0) for one mono window
    fn infer(&mut self, window: &[f32]) -> Result<f32, Error>;

    /// Clear recurrent state between sessions
    fn reset(&mut self) {}
}

/// What a speech-to-text engine can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SttCapabilities {
    /// Accepts audio incrementally and emits events while the user talks
    pub streaming: bool,
    /// Emits interim hypotheses
    pub interim_results: bool,
}

/// A native streaming recognition session
pub struct SttStream {
    /// Audio input; close it to flush and end the session
    pub input: Sender<AudioFrame>,
    /// Recognition events, ending after the input is closed and flushed
    pub events: Receiver<Result<SpeechEvent, Error>>,
}

/// Speech-to-text engine
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Provider name for logs and metrics
    fn name(&self) -> &str;

    fn capabilities(&self) -> SttCapabilities;

    /// Recognize one complete utterance
    async fn recognize(&self, audio: &AudioFrame, language: Option<&str>) -> Result<SpeechEvent, Error>;

    /// Open a streaming session. Only engines with `streaming` capability support this.
    async fn stream(&self, _language: Option<&str>) -> Result<SttStream, Error> {
        Err(ProviderError::fatal(self.name(), "streaming recognition not supported").into())
    }
}

/// Ordered audio chunks for one synthesis request
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<AudioFrame, Error>> + Send>>;

/// What a text-to-speech engine can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtsCapabilities {
    /// Produces audio chunks before synthesis of the whole text completes
    pub streaming: bool,
    /// Output sample rate
    pub sample_rate: u32,
}

/// Text-to-speech engine
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Provider name for logs and metrics
    fn name(&self) -> &str;

    fn capabilities(&self) -> TtsCapabilities;

    /// Synthesize one segment of text
    async fn synthesize(&self, text: &str) -> Result<AudioStream, Error>;

    /// Release idle connections held for this engine
    fn close(&self) {}
}

//! Streaming Speech-to-Text
//!
//! Engines that stream natively are used as-is. Batch engines are wrapped by
//! [`StreamAdapter`], which segments audio with a VAD stream and recognizes each
//! utterance as a whole.

mod adapter;

pub use adapter::StreamAdapter;

use voice_session_core::SttStream;

use crate::PipelineError;

/// Open a recognition stream, preferring the engine's native streaming mode
pub async fn open_recognition(
    adapter: &StreamAdapter,
    language: Option<&str>,
) -> Result<SttStream, PipelineError> {
    let stt = adapter.engine();
    if stt.capabilities().streaming {
        tracing::debug!(provider = stt.name(), "Opening native STT stream");
        return Ok(stt.stream(language).await?);
    }

    tracing::debug!(provider = stt.name(), "Opening VAD-segmented STT stream");
    adapter.open(language)
}

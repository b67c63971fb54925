//! VAD-segmented adapter for batch STT engines

use std::sync::Arc;

use voice_session_core::{
    channel, retry_with_backoff, AudioFrame, Error, RetryPolicy, SpeechEvent, SpeechToText,
    SttStream,
};

use crate::vad::{VadEvent, VadEventKind, VadModelFactory, VadOptions, VadProcessor, VadStream};
use crate::PipelineError;

/// Turns a batch [`SpeechToText`] into a stream of speech events
#[derive(Clone)]
pub struct StreamAdapter {
    stt: Arc<dyn SpeechToText>,
    vad: VadModelFactory,
    vad_options: VadOptions,
    retry: RetryPolicy,
}

impl StreamAdapter {
    pub fn new(stt: Arc<dyn SpeechToText>, vad: VadModelFactory, vad_options: VadOptions) -> Self {
        Self {
            stt,
            vad,
            vad_options,
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for each utterance
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The wrapped engine
    pub fn engine(&self) -> &Arc<dyn SpeechToText> {
        &self.stt
    }

    /// Start a segmented recognition session
    ///
    /// Each VAD utterance becomes one `recognize` call; results are emitted in
    /// utterance order. Closing the input flushes the open utterance and ends the stream.
    pub fn open(&self, language: Option<&str>) -> Result<SttStream, PipelineError> {
        let processor = VadProcessor::new((self.vad)(), self.vad_options.clone())?;
        let (input, mut vad_events, _vad_task) = VadStream::spawn(processor).into_parts();
        let (events_tx, events) = channel::<Result<SpeechEvent, Error>>();

        let stt = self.stt.clone();
        let retry = self.retry.clone();
        let language = language.map(str::to_owned);

        tokio::spawn(async move {
            while let Some(event) = vad_events.recv().await {
                let out = match event.kind {
                    VadEventKind::StartOfSpeech => Some(Ok(SpeechEvent::start_of_speech())),
                    VadEventKind::EndOfSpeech => {
                        recognize_utterance(stt.as_ref(), &retry, &event, language.as_deref()).await
                    }
                    VadEventKind::InferenceDone => None,
                };

                if let Some(out) = out {
                    if events_tx.send(out).is_err() {
                        tracing::debug!("STT event receiver closed, stopping adapter");
                        return;
                    }
                }
            }
            events_tx.close();
        });

        Ok(SttStream { input, events })
    }
}

async fn recognize_utterance(
    stt: &dyn SpeechToText,
    retry: &RetryPolicy,
    event: &VadEvent,
    language: Option<&str>,
) -> Option<Result<SpeechEvent, Error>> {
    if event.frames.is_empty() {
        return None;
    }

    let audio = match AudioFrame::combine(&event.frames) {
        Ok(audio) => audio,
        Err(e) => return Some(Err(e.into())),
    };

    let result = retry_with_backoff(retry, "stt.recognize", || stt.recognize(&audio, language)).await;
    match result {
        Ok(mut speech) => {
            if speech.text().trim().is_empty() {
                tracing::debug!(
                    audio_ms = audio.duration().as_millis() as u64,
                    "Utterance produced no text"
                );
                return None;
            }
            if let Some(data) = speech.data.as_mut() {
                if data.end_time_ms == 0 {
                    let end_ms = event.timestamp.saturating_sub(event.silence_duration).as_millis() as u64;
                    let start_ms = end_ms.saturating_sub(audio.duration().as_millis() as u64);
                    data.start_time_ms = start_ms;
                    data.end_time_ms = end_ms;
                }
            }
            speech.kind = voice_session_core::SpeechEventKind::FinalTranscript;
            Some(Ok(speech))
        }
        Err(e) => {
            tracing::error!(provider = stt.name(), "Utterance recognition failed: {}", e);
            Some(Err(e))
        }
    }
}

//! Speech recognition event types

use serde::{Deserialize, Serialize};

/// Kind of event produced by a speech-to-text stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechEventKind {
    /// The engine detected the start of an utterance
    StartOfSpeech,
    /// Unstable hypothesis, may still change
    InterimTranscript,
    /// Stable transcript for a span of audio
    FinalTranscript,
}

/// One recognition hypothesis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechData {
    /// Transcribed text
    pub text: String,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,

    /// Detected language (ISO 639-1 code)
    pub language: Option<String>,

    /// Start time offset (ms from stream start)
    pub start_time_ms: u64,

    /// End time offset (ms from stream start)
    pub end_time_ms: u64,
}

impl SpeechData {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            language: None,
            start_time_ms: 0,
            end_time_ms: 0,
        }
    }

    /// Set language
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Set time range
    pub fn with_time_range(mut self, start_ms: u64, end_ms: u64) -> Self {
        self.start_time_ms = start_ms;
        self.end_time_ms = end_ms;
        self
    }

    /// Check if transcript is empty
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Get word count
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Event emitted by a speech-to-text stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechEvent {
    pub kind: SpeechEventKind,

    /// Best hypothesis; absent for `StartOfSpeech`
    pub data: Option<SpeechData>,
}

impl SpeechEvent {
    pub fn start_of_speech() -> Self {
        Self {
            kind: SpeechEventKind::StartOfSpeech,
            data: None,
        }
    }

    /// Create an interim (non-final) transcript event
    pub fn interim(data: SpeechData) -> Self {
        Self {
            kind: SpeechEventKind::InterimTranscript,
            data: Some(data),
        }
    }

    /// Create a final transcript event
    pub fn final_transcript(data: SpeechData) -> Self {
        Self {
            kind: SpeechEventKind::FinalTranscript,
            data: Some(data),
        }
    }

    /// Transcript text, empty when the event carries none
    pub fn text(&self) -> &str {
        self.data.as_ref().map(|d| d.text.as_str()).unwrap_or("")
    }

    pub fn is_final(&self) -> bool {
        self.kind == SpeechEventKind::FinalTranscript
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_count() {
        let data = SpeechData::new("  please   stop talking ", 0.9);
        assert_eq!(data.word_count(), 3);
        assert!(!data.is_empty());
        assert!(SpeechData::new("   ", 0.1).is_empty());
    }

    #[test]
    fn test_event_text() {
        assert_eq!(SpeechEvent::start_of_speech().text(), "");
        let ev = SpeechEvent::final_transcript(SpeechData::new("hello", 0.8).with_language("en"));
        assert!(ev.is_final());
        assert_eq!(ev.text(), "hello");
        assert_eq!(ev.data.unwrap().language.as_deref(), Some("en"));
    }
}

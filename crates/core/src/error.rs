//! Error types for the voice session engine

use thiserror::Error;

use crate::channel::ChannelClosed;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type shared by the workspace crates
#[derive(Error, Debug)]
pub enum Error {
    // Audio errors
    #[error("Audio processing error: {0}")]
    Audio(#[from] AudioError),

    // External provider errors (VAD/STT/LLM/TTS/agent service)
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Channel closed")]
    ChannelClosed(#[from] ChannelClosed),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Audio-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),

    #[error("Format mismatch: expected {expected}, got {actual}")]
    FormatMismatch { expected: String, actual: String },

    #[error("Codec error: {0}")]
    Codec(String),
}

/// Errors reported by external collaborators
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Network failures, 5xx responses, rate limiting
    #[error("{provider} request failed: {message}")]
    Transient { provider: String, message: String },

    /// Requests that will not succeed on retry (4xx, malformed payloads)
    #[error("{provider} rejected request: {message}")]
    Fatal { provider: String, message: String },

    #[error("{provider} timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },
}

impl ProviderError {
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn fatal(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn timeout(provider: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            provider: provider.into(),
            timeout_ms,
        }
    }

    /// Whether the call site should retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// Name of the provider that failed
    pub fn provider(&self) -> &str {
        match self {
            Self::Transient { provider, .. }
            | Self::Fatal { provider, .. }
            | Self::Timeout { provider, .. } => provider,
        }
    }
}

impl Error {
    /// Create a generic error from a string
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Error::Other(msg.into())
    }

    /// Create a config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider(e) => e.is_retryable(),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_retryable() {
        assert!(ProviderError::transient("stt", "connection reset").is_retryable());
        assert!(ProviderError::timeout("tts", 5000).is_retryable());
        assert!(!ProviderError::fatal("llm", "401 unauthorized").is_retryable());
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = ProviderError::timeout("tts", 250).into();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Provider error: tts timed out after 250ms");

        let err: Error = AudioError::UnsupportedSampleRate(11025).into();
        assert!(!err.is_retryable());
    }
}

//! Language model integration
//!
//! Features:
//! - OpenAI-compatible streaming chat client (server-sent events)
//! - Reply assembly: content passthrough, tool-call reassembly, emotion tag
//! - Prompt building with a token-budgeted context window

pub mod client;
pub mod prompt;
pub mod streaming;

pub use client::{OpenAiChatClient, OpenAiChatConfig, SseDecoder, SseEvent};
pub use prompt::{to_openai_messages, PromptBuilder};
pub use streaming::{AssembledReply, ReplyAssembler, ToolCall};

use thiserror::Error;
use voice_session_core::ProviderError;

/// LLM errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl LlmError {
    /// Network failures, 429 and 5xx are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Network(_) | LlmError::Timeout => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<LlmError> for voice_session_core::Error {
    fn from(err: LlmError) -> Self {
        let provider = "llm";
        match err {
            LlmError::Configuration(msg) => voice_session_core::Error::Config(msg),
            LlmError::Timeout => ProviderError::timeout(provider, 0).into(),
            other if other.is_retryable() => ProviderError::transient(provider, other.to_string()).into(),
            other => ProviderError::fatal(provider, other.to_string()).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(LlmError::Api { status: 503, message: "busy".into() }.is_retryable());
        assert!(LlmError::Api { status: 429, message: "slow down".into() }.is_retryable());
        assert!(!LlmError::Api { status: 401, message: "key".into() }.is_retryable());

        let err: voice_session_core::Error = LlmError::Network("reset".into()).into();
        assert!(err.is_retryable());
        let err: voice_session_core::Error = LlmError::InvalidResponse("junk".into()).into();
        assert!(!err.is_retryable());
    }
}

//! Configuration management for the voice session engine
//!
//! Supports loading configuration from:
//! - TOML/YAML files under `config/`
//! - Environment variables (`VOICE_SESSION__` prefix, `__` separator)
//! - Per-connection overrides merged once at session start

pub mod pipeline;
pub mod settings;

pub use pipeline::{
    EndpointingSettings, InterruptionSettings, ListenMode, OutputSettings, PipelineSettings,
    SessionOverrides, TtsSettings, VadSettings,
};
pub use settings::{
    load_settings, AgentServiceConfig, HistoryConfig, LlmProviderConfig, ObservabilityConfig,
    ProvidersConfig, RateLimitConfig, RetryConfig, ServerConfig, SessionConfig, Settings,
    SttProviderConfig, TtsProviderConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::pipeline::{ListenMode, PipelineSettings};
use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-session defaults
    #[serde(default)]
    pub session: SessionConfig,

    /// Pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// External STT/LLM/TTS providers
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Agent configuration service
    #[serde(default)]
    pub agent_service: AgentServiceConfig,

    /// Chat history reporting
    #[serde(default)]
    pub history: HistoryConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;

        if self.server.max_sessions == 0 {
            return Err(ConfigError::invalid("server.max_sessions", "must be at least 1"));
        }

        if self.session.agent_ready_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "session.agent_ready_timeout_ms",
                "must be non-zero",
            ));
        }

        if self.providers.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "providers.retry.max_attempts",
                "must be at least 1",
            ));
        }

        let mut warnings = Vec::new();
        if self.providers.llm.api_key.is_none() {
            warnings.push("providers.llm.api_key is not set");
        }
        if self.providers.stt.api_key.is_none() {
            warnings.push("providers.stt.api_key is not set");
        }
        if self.providers.tts.api_key.is_none() {
            warnings.push("providers.tts.api_key is not set");
        }
        if !warnings.is_empty() {
            tracing::warn!("Provider configuration warnings:\n  - {}", warnings.join("\n  - "));
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket path
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_ws_path() -> String {
    "/ws/voice".to_string()
}
fn default_max_sessions() -> usize {
    200
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            max_sessions: default_max_sessions(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum control messages per second per connection
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: u32,

    /// Maximum audio bytes per second per connection
    #[serde(default = "default_audio_bytes_per_second")]
    pub audio_bytes_per_second: u32,

    /// Burst allowance (multiple of rate limit)
    #[serde(default = "default_burst_multiplier")]
    pub burst_multiplier: f32,
}

fn default_messages_per_second() -> u32 {
    50
}
fn default_audio_bytes_per_second() -> u32 {
    // 16kHz * 2 bytes * 2 channels of headroom
    64_000
}
fn default_burst_multiplier() -> f32 {
    2.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            messages_per_second: default_messages_per_second(),
            audio_bytes_per_second: default_audio_bytes_per_second(),
            burst_multiplier: default_burst_multiplier(),
        }
    }
}

/// Per-session defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Listen mode when the client does not pick one
    #[serde(default)]
    pub listen_mode: ListenMode,

    /// Recognition language
    #[serde(default = "default_language")]
    pub language: String,

    /// System prompt for agents that do not define one
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Spoken when the session cannot load its agent
    #[serde(default = "default_unavailable_message")]
    pub unavailable_message: String,

    /// How long turn processing waits for the agent to be ready (ms)
    #[serde(default = "default_agent_ready_timeout")]
    pub agent_ready_timeout_ms: u64,

    /// Close sessions idle longer than this (seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Dialogue items kept in the language model context
    #[serde(default = "default_max_context_items")]
    pub max_context_items: usize,
}

fn default_language() -> String {
    "en".to_string()
}
fn default_system_prompt() -> String {
    "You are a helpful voice assistant. Keep answers short and conversational.".to_string()
}
fn default_unavailable_message() -> String {
    "Sorry, this assistant is not available right now. Please try again later.".to_string()
}
fn default_agent_ready_timeout() -> u64 {
    5000
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_max_context_items() -> usize {
    40
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_mode: ListenMode::Auto,
            language: default_language(),
            system_prompt: default_system_prompt(),
            unavailable_message: default_unavailable_message(),
            agent_ready_timeout_ms: default_agent_ready_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            max_context_items: default_max_context_items(),
        }
    }
}

/// External provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub stt: SttProviderConfig,

    #[serde(default)]
    pub llm: LlmProviderConfig,

    #[serde(default)]
    pub tts: TtsProviderConfig,

    /// Retry policy for transient provider failures
    #[serde(default)]
    pub retry: RetryConfig,
}

/// OpenAI-compatible transcription endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttProviderConfig {
    #[serde(default = "default_openai_url")]
    pub base_url: String,

    /// Set via VOICE_SESSION__PROVIDERS__STT__API_KEY
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_stt_model")]
    pub model: String,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_stt_model() -> String {
    "whisper-1".to_string()
}
fn default_provider_timeout() -> u64 {
    30
}

impl Default for SttProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_url(),
            api_key: None,
            model: default_stt_model(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

/// OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    #[serde(default = "default_openai_url")]
    pub base_url: String,

    /// Set via VOICE_SESSION__PROVIDERS__LLM__API_KEY
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    512
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_url(),
            api_key: None,
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

/// OpenAI-compatible speech endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsProviderConfig {
    #[serde(default = "default_openai_url")]
    pub base_url: String,

    /// Set via VOICE_SESSION__PROVIDERS__TTS__API_KEY
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_tts_model")]
    pub model: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    /// Sample rate of the raw PCM the endpoint returns
    #[serde(default = "default_tts_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}
fn default_voice() -> String {
    "alloy".to_string()
}
fn default_tts_sample_rate() -> u32 {
    24000
}

impl Default for TtsProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_url(),
            api_key: None,
            model: default_tts_model(),
            voice: default_voice(),
            sample_rate: default_tts_sample_rate(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    100
}
fn default_max_backoff() -> u64 {
    2000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// Agent configuration service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentServiceConfig {
    /// Base URL; when unset every connection uses the default agent
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token for the service
    #[serde(default)]
    pub api_key: Option<String>,

    /// How long fetched agent profiles stay cached (seconds)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Request timeout (ms)
    #[serde(default = "default_agent_timeout")]
    pub timeout_ms: u64,
}

fn default_cache_ttl() -> u64 {
    30
}
fn default_agent_timeout() -> u64 {
    3000
}

impl Default for AgentServiceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            cache_ttl_secs: default_cache_ttl(),
            timeout_ms: default_agent_timeout(),
        }
    }
}

/// Chat history reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Endpoint receiving chat reports; reporting is disabled when unset
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Delivery attempts per report
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How long close waits for queued reports (ms)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

fn default_drain_timeout() -> u64 {
    2000
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_attempts: default_max_attempts(),
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,

    /// Enable metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (VOICE_SESSION__ prefix)
/// 2. config/{env}.toml|yaml (if env specified)
/// 3. config/default.toml|yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder = builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("VOICE_SESSION")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

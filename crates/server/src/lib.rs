//! Voice Session Server
//!
//! Provides the WebSocket voice endpoint and the HTTP health/metrics endpoints, plus the
//! per-connection session orchestrator and its service clients.

pub mod agent_config;
pub mod history;
pub mod http;
pub mod metrics;
pub mod options;
pub mod orchestrator;
pub mod protocol;
pub mod providers;
pub mod rate_limit;
pub mod reply_cache;
pub mod session;
pub mod state;
pub mod websocket;

pub use agent_config::{AgentDirectory, AgentProfile};
pub use history::{ChatReport, HistoryReporter, HttpReportSink, ReportSink};
pub use http::create_router;
pub use metrics::init_metrics;
pub use orchestrator::{SessionParams, VoiceSession};
pub use protocol::{AudioParams, ClientMessage, ListenState, ServerMessage, TtsState};
pub use providers::Providers;
pub use rate_limit::{RateLimitError, RateLimiter};
pub use reply_cache::{FlightGuard, ReplyCache, SingleFlight};
pub use session::{SessionEntry, SessionManager};
pub use state::AppState;
pub use websocket::InboundAudio;

use thiserror::Error;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Session error: {0}")]
    Session(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Transport(#[from] voice_session_transport::TransportError),

    #[error(transparent)]
    Core(#[from] voice_session_core::Error),
}

impl From<voice_session_pipeline::PipelineError> for ServerError {
    fn from(err: voice_session_pipeline::PipelineError) -> Self {
        ServerError::Internal(err.to_string())
    }
}

impl From<ServerError> for axum::http::StatusCode {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Session(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            ServerError::WebSocket(_) | ServerError::Protocol(_) => {
                axum::http::StatusCode::BAD_REQUEST
            }
            ServerError::AgentUnavailable(_) => axum::http::StatusCode::BAD_GATEWAY,
            ServerError::RateLimit => axum::http::StatusCode::TOO_MANY_REQUESTS,
            ServerError::InvalidRequest(_) => axum::http::StatusCode::BAD_REQUEST,
            ServerError::Transport(_) | ServerError::Core(_) | ServerError::Internal(_) => {
                axum::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

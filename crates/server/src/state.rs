//! Application State
//!
//! Shared state across all handlers and sessions.

use std::sync::Arc;
use std::time::Duration;

use voice_session_config::Settings;

use crate::agent_config::AgentDirectory;
use crate::history::{HttpReportSink, ReportSink};
use crate::options::retry_policy;
use crate::providers::Providers;
use crate::reply_cache::ReplyCache;
use crate::session::SessionManager;
use crate::ServerError;

/// Application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration
    pub config: Arc<Settings>,
    /// Session registry
    pub sessions: Arc<SessionManager>,
    /// HTTP client shared by every outbound service call
    pub http: reqwest::Client,
    /// Agent-configuration client
    pub agents: Arc<AgentDirectory>,
    /// Pre-rendered replies shared across connections
    pub reply_cache: Arc<ReplyCache>,
    pub providers: Providers,
    /// Chat-history destination; `None` disables reporting
    pub history: Option<Arc<dyn ReportSink>>,
}

impl AppState {
    /// Build state with the OpenAI-compatible providers from `config`
    pub fn new(config: Settings) -> Result<Self, ServerError> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ServerError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        let providers = Providers::from_settings(&config, http.clone())?;
        Ok(Self::with_providers(config, http, providers))
    }

    /// Build state around an explicit provider set
    pub fn with_providers(config: Settings, http: reqwest::Client, providers: Providers) -> Self {
        let sessions = SessionManager::new(
            config.server.max_sessions,
            Duration::from_secs(config.session.idle_timeout_secs),
        );
        let agents = AgentDirectory::new(http.clone(), config.agent_service.clone())
            .with_retry(retry_policy(&config.providers.retry));
        let history = config.history.endpoint.as_ref().map(|endpoint| {
            Arc::new(HttpReportSink::new(http.clone(), endpoint.clone())) as Arc<dyn ReportSink>
        });

        Self {
            config: Arc::new(config),
            sessions: Arc::new(sessions),
            http,
            agents: Arc::new(agents),
            reply_cache: Arc::new(ReplyCache::new()),
            providers,
            history,
        }
    }

    /// Report chat history somewhere other than the configured endpoint
    pub fn with_history_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.history = Some(sink);
        self
    }
}

//! Agent configuration client
//!
//! Agent profiles come from an external service (`GET {base_url}/agents/{id}`) and are cached
//! per process with a TTL. Connections without an agent id use the default profile.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use voice_session_config::{AgentServiceConfig, SessionConfig, SessionOverrides};
use voice_session_core::{retry_with_backoff, Error, RetryPolicy};

use crate::providers::{check_status, request_error};
use crate::ServerError;

const PROVIDER: &str = "agent-service";

/// What the session needs to know about an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Spoken when the session becomes ready
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    /// Pipeline tuning for this agent
    #[serde(default)]
    pub overrides: SessionOverrides,
}

impl AgentProfile {
    /// Profile used by device-only connections
    pub fn default_for(session: &SessionConfig) -> Self {
        Self {
            id: "default".to_string(),
            name: "Assistant".to_string(),
            system_prompt: Some(session.system_prompt.clone()),
            greeting: None,
            language: Some(session.language.clone()),
            voice: None,
            overrides: SessionOverrides::default(),
        }
    }

    /// Overrides for this agent; top-level profile fields fill unset override fields
    pub fn session_overrides(&self) -> SessionOverrides {
        let mut overrides = self.overrides.clone();
        if overrides.system_prompt.is_none() {
            overrides.system_prompt = self.system_prompt.clone();
        }
        if overrides.greeting.is_none() {
            overrides.greeting = self.greeting.clone();
        }
        if overrides.language.is_none() {
            overrides.language = self.language.clone();
        }
        if overrides.voice.is_none() {
            overrides.voice = self.voice.clone();
        }
        overrides
    }
}

/// Caching client for the agent-configuration service
pub struct AgentDirectory {
    http: reqwest::Client,
    config: AgentServiceConfig,
    retry: RetryPolicy,
    cache: DashMap<String, (Instant, Arc<AgentProfile>)>,
}

impl AgentDirectory {
    pub fn new(http: reqwest::Client, config: AgentServiceConfig) -> Self {
        Self {
            http,
            config,
            retry: RetryPolicy::default(),
            cache: DashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache_ttl_secs)
    }

    /// Fresh cached profile, if any
    pub fn cached(&self, agent_id: &str) -> Option<Arc<AgentProfile>> {
        let entry = self.cache.get(agent_id)?;
        let (fetched_at, profile) = entry.value();
        (fetched_at.elapsed() < self.ttl()).then(|| profile.clone())
    }

    /// Seed the cache (preloaded or test profiles)
    pub fn insert(&self, profile: AgentProfile) -> Arc<AgentProfile> {
        let profile = Arc::new(profile);
        self.cache
            .insert(profile.id.clone(), (Instant::now(), profile.clone()));
        profile
    }

    /// Resolve an agent, from cache or the service
    ///
    /// Transient failures are retried with backoff; anything left is reported as the agent
    /// being unavailable.
    pub async fn fetch(&self, agent_id: &str) -> Result<Arc<AgentProfile>, ServerError> {
        if let Some(profile) = self.cached(agent_id) {
            return Ok(profile);
        }

        let Some(base_url) = self.config.base_url.as_deref() else {
            return Err(ServerError::AgentUnavailable(format!(
                "agent {} requested but no agent service is configured",
                agent_id
            )));
        };
        let url = format!("{}/agents/{}", base_url.trim_end_matches('/'), agent_id);

        let mut profile: AgentProfile = retry_with_backoff(&self.retry, "agent_config", || {
            self.request(&url)
        })
        .await
        .map_err(|e| ServerError::AgentUnavailable(e.to_string()))?;

        if profile.id.is_empty() {
            profile.id = agent_id.to_string();
        }
        tracing::debug!(agent_id, name = %profile.name, "Fetched agent profile");

        let profile = Arc::new(profile);
        self.cache
            .insert(agent_id.to_string(), (Instant::now(), profile.clone()));
        Ok(profile)
    }

    async fn request(&self, url: &str) -> Result<AgentProfile, Error> {
        let mut request = self
            .http
            .get(url)
            .timeout(Duration::from_millis(self.config.timeout_ms));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| request_error(PROVIDER, e))?;
        let response = check_status(PROVIDER, response).await?;
        response
            .json::<AgentProfile>()
            .await
            .map_err(|e| request_error(PROVIDER, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(base_url: Option<&str>) -> AgentDirectory {
        AgentDirectory::new(
            reqwest::Client::new(),
            AgentServiceConfig {
                base_url: base_url.map(str::to_string),
                ..AgentServiceConfig::default()
            },
        )
    }

    #[test]
    fn test_profile_fields_fill_overrides() {
        let profile: AgentProfile = serde_json::from_str(
            r#"{"id":"a1","name":"Mia","system_prompt":"You are Mia.","voice":"nova",
                "overrides":{"voice":"shimmer","min_endpoint_delay_ms":300}}"#,
        )
        .unwrap();

        let overrides = profile.session_overrides();
        assert_eq!(overrides.system_prompt.as_deref(), Some("You are Mia."));
        // Explicit override wins
        assert_eq!(overrides.voice.as_deref(), Some("shimmer"));
        assert_eq!(overrides.min_endpoint_delay_ms, Some(300));
    }

    #[test]
    fn test_default_profile_uses_session_config() {
        let session = SessionConfig::default();
        let profile = AgentProfile::default_for(&session);
        assert_eq!(profile.system_prompt.as_deref(), Some(session.system_prompt.as_str()));
        assert_eq!(profile.language.as_deref(), Some(session.language.as_str()));
    }

    #[tokio::test]
    async fn test_unconfigured_service_is_unavailable() {
        let err = directory(None).fetch("a1").await.unwrap_err();
        assert!(matches!(err, ServerError::AgentUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_serves_until_ttl() {
        let directory = directory(None);
        directory.insert(AgentProfile {
            id: "a1".to_string(),
            ..AgentProfile::default_for(&SessionConfig::default())
        });

        assert_eq!(directory.fetch("a1").await.unwrap().id, "a1");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(directory.cached("a1").is_none());
        assert!(directory.fetch("a1").await.is_err());
    }
}

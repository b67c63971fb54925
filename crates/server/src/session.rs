//! Session Registry
//!
//! Tracks live voice sessions, caps concurrency and stops sessions that go idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::metrics;
use crate::ServerError;

/// Registry entry for one connection
pub struct SessionEntry {
    pub id: String,
    pub created_at: Instant,
    last_activity: RwLock<Instant>,
    stop: watch::Sender<bool>,
}

impl SessionEntry {
    fn new(id: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_activity: RwLock::new(now),
            stop: watch::channel(false).0,
        }
    }

    /// Record client activity
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    /// Ask the connection to shut down
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called
    pub async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Session manager
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    max_sessions: usize,
    idle_timeout: Duration,
    cleanup_interval: Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            idle_timeout,
            cleanup_interval: Duration::from_secs(30),
        }
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Periodically stop idle sessions
    ///
    /// Returns a shutdown sender; sending `true` ends the task.
    pub fn start_cleanup_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let interval = manager.cleanup_interval;

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval_timer.tick() => {
                        let removed = manager.cleanup_expired();
                        if removed > 0 {
                            tracing::info!(
                                "Session cleanup: stopped {} idle sessions ({} remaining)",
                                removed,
                                manager.count()
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Session cleanup task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    /// Register a new connection
    pub fn register(&self) -> Result<Arc<SessionEntry>, ServerError> {
        let mut sessions = self.sessions.write();

        if sessions.len() >= self.max_sessions {
            self.cleanup_expired_internal(&mut sessions);
            if sessions.len() >= self.max_sessions {
                return Err(ServerError::Session(format!(
                    "Max sessions reached ({})",
                    self.max_sessions
                )));
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let entry = Arc::new(SessionEntry::new(id.clone()));
        sessions.insert(id.clone(), entry.clone());

        metrics::record_session_created();
        metrics::record_active_sessions(sessions.len());
        tracing::info!(session_id = %id, "Registered session");

        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove a session. Removing twice is a no-op.
    pub fn remove(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        metrics::record_active_sessions(sessions.len());
        match removed {
            Some(entry) => {
                entry.stop();
                tracing::info!(session_id = %id, "Removed session");
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }

    /// Stop and remove idle sessions, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write();
        self.cleanup_expired_internal(&mut sessions)
    }

    fn cleanup_expired_internal(&self, sessions: &mut HashMap<String, Arc<SessionEntry>>) -> usize {
        let timeout = self.idle_timeout;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.is_expired(timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = sessions.remove(id) {
                entry.stop();
                tracing::info!(session_id = %id, "Stopped idle session");
            }
        }
        if !expired.is_empty() {
            metrics::record_active_sessions(sessions.len());
        }
        expired.len()
    }

    pub fn list(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_limit() {
        let manager = SessionManager::new(2, Duration::from_secs(300));
        let a = manager.register().unwrap();
        let _b = manager.register().unwrap();
        assert!(matches!(manager.register(), Err(ServerError::Session(_))));

        assert!(manager.remove(&a.id));
        assert!(a.is_stopped());
        assert!(manager.register().is_ok());
    }

    #[test]
    fn test_remove_twice_is_noop() {
        let manager = SessionManager::new(4, Duration::from_secs(300));
        let entry = manager.register().unwrap();
        assert!(manager.get(&entry.id).is_some());
        assert!(manager.remove(&entry.id));
        assert!(!manager.remove(&entry.id));
        assert!(manager.get(&entry.id).is_none());
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_are_stopped() {
        let manager = SessionManager::new(4, Duration::from_secs(60));
        let idle = manager.register().unwrap();
        let active = manager.register().unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        active.touch();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(manager.cleanup_expired(), 1);
        assert!(idle.is_stopped());
        assert!(!active.is_stopped());
        assert_eq!(manager.list(), vec![active.id.clone()]);

        // Connection side observes the stop
        idle.stopped().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_runs_periodically() {
        let manager = Arc::new(
            SessionManager::new(4, Duration::from_secs(10)).with_cleanup_interval(Duration::from_secs(5)),
        );
        let entry = manager.register().unwrap();
        let shutdown = manager.start_cleanup_task();

        tokio::time::timeout(Duration::from_secs(30), entry.stopped())
            .await
            .expect("idle session should be stopped");
        assert_eq!(manager.count(), 0);

        shutdown.send(true).unwrap();
    }
}

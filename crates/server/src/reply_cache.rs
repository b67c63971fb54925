//! Pre-rendered reply cache shared across connections
//!
//! Canned replies (greetings, fallback messages) are synthesized once and reused. At most
//! one regeneration runs per key; other callers get the stale entry or nothing instead of
//! waiting for it.

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use voice_session_core::{AudioFrame, Error};

/// Tracks keys with a regeneration in flight
pub struct SingleFlight<K> {
    active: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim `key`; `None` if another caller holds it
    pub fn try_begin(&self, key: K) -> Option<FlightGuard<K>> {
        let mut active = self.active.lock();
        if !active.insert(key.clone()) {
            return None;
        }
        Some(FlightGuard {
            active: self.active.clone(),
            key: Some(key),
        })
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.active.lock().contains(key)
    }
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases its key when dropped
pub struct FlightGuard<K: Eq + Hash> {
    active: Arc<Mutex<HashSet<K>>>,
    key: Option<K>,
}

impl<K: Eq + Hash> Drop for FlightGuard<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.active.lock().remove(&key);
        }
    }
}

#[derive(Clone)]
struct CachedReply {
    frames: Arc<[AudioFrame]>,
    rendered_at: Instant,
}

/// Rendered audio keyed by voice and text
#[derive(Default)]
pub struct ReplyCache {
    entries: DashMap<String, CachedReply>,
    flights: SingleFlight<String>,
}

impl ReplyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key for a reply rendered with `voice`
    pub fn key(voice: &str, text: &str) -> String {
        format!("{}\u{1f}{}", voice, text)
    }

    /// Cached audio for `key`, rendering or refreshing it as needed
    ///
    /// - fresh entry: returned as-is
    /// - stale entry: returned immediately; a background refresh starts unless one is running
    /// - no entry: the first caller renders inline; callers arriving meanwhile get `None`
    pub async fn get_or_refresh<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        ttl: Duration,
        render: F,
    ) -> Option<Arc<[AudioFrame]>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<AudioFrame>, Error>> + Send + 'static,
    {
        let cached = self.entries.get(key).map(|entry| entry.value().clone());

        if let Some(entry) = cached {
            if entry.rendered_at.elapsed() >= ttl {
                if let Some(guard) = self.flights.try_begin(key.to_string()) {
                    let cache = Arc::clone(self);
                    let key = key.to_string();
                    tokio::spawn(async move {
                        let _guard = guard;
                        match render().await {
                            Ok(frames) => {
                                cache.insert(&key, frames);
                                tracing::debug!(key = %key, "Refreshed cached reply");
                            }
                            Err(e) => tracing::warn!("Cached reply refresh failed: {}", e),
                        }
                    });
                }
            }
            return Some(entry.frames);
        }

        let _guard = self.flights.try_begin(key.to_string())?;
        match render().await {
            Ok(frames) => Some(self.insert(key, frames)),
            Err(e) => {
                tracing::warn!("Rendering cached reply failed: {}", e);
                None
            }
        }
    }

    pub fn insert(&self, key: &str, frames: Vec<AudioFrame>) -> Arc<[AudioFrame]> {
        let frames: Arc<[AudioFrame]> = frames.into();
        self.entries.insert(
            key.to_string(),
            CachedReply {
                frames: frames.clone(),
                rendered_at: Instant::now(),
            },
        );
        frames
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn frames(value: i16) -> Vec<AudioFrame> {
        vec![AudioFrame::new(vec![value; 160], 16000, 1).unwrap()]
    }

    #[test]
    fn test_single_flight_guard_releases_on_drop() {
        let flights = SingleFlight::<String>::new();
        let guard = flights.try_begin("greeting".to_string()).unwrap();
        assert!(flights.try_begin("greeting".to_string()).is_none());
        assert!(flights.try_begin("other".to_string()).is_some());
        assert!(flights.is_active(&"greeting".to_string()));

        drop(guard);
        assert!(!flights.is_active(&"greeting".to_string()));
        assert!(flights.try_begin("greeting".to_string()).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_miss_does_not_wait() {
        let cache = Arc::new(ReplyCache::new());
        let release = Arc::new(Notify::new());
        let renders = Arc::new(AtomicUsize::new(0));

        let first = {
            let cache = cache.clone();
            let release = release.clone();
            let renders = renders.clone();
            tokio::spawn(async move {
                cache
                    .get_or_refresh("k", Duration::from_secs(60), move || async move {
                        renders.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Ok(frames(1))
                    })
                    .await
            })
        };

        // Let the first caller claim the key
        while !cache.flights.is_active(&"k".to_string()) {
            tokio::task::yield_now().await;
        }

        let renders_second = renders.clone();
        let second = cache
            .get_or_refresh("k", Duration::from_secs(60), move || async move {
                renders_second.fetch_add(1, Ordering::SeqCst);
                Ok(frames(2))
            })
            .await;
        assert!(second.is_none());

        release.notify_one();
        let rendered = first.await.unwrap().unwrap();
        assert_eq!(rendered[0].samples()[0], 1);
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_served_while_refreshing() {
        let cache = Arc::new(ReplyCache::new());
        cache.insert("k", frames(1));

        tokio::time::advance(Duration::from_secs(31)).await;

        let stale = cache
            .get_or_refresh("k", Duration::from_secs(30), || async { Ok(frames(2)) })
            .await
            .unwrap();
        assert_eq!(stale[0].samples()[0], 1);

        // Background refresh replaces the entry
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let fresh = cache
            .get_or_refresh("k", Duration::from_secs(30), || async {
                Err(Error::other("not called"))
            })
            .await
            .unwrap();
        assert_eq!(fresh[0].samples()[0], 2);
    }

    #[tokio::test]
    async fn test_render_failure_leaves_no_entry() {
        let cache = Arc::new(ReplyCache::new());
        let result = cache
            .get_or_refresh("k", Duration::from_secs(30), || async {
                Err(Error::other("tts down"))
            })
            .await;
        assert!(result.is_none());
        assert!(cache.is_empty());
        assert!(!cache.flights.is_active(&"k".to_string()));
    }
}

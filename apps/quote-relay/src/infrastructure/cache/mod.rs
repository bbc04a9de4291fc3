//! In-Memory Cache
//!
//! TTL key/value store implementing [`CacheStore`]. Expired entries read as
//! absent and are removed lazily on access or by [`InMemoryCache::purge_expired`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::application::ports::{CacheError, CacheStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Process-local cache with per-entry expiry.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining lifetime of a live entry.
    ///
    /// `None` when the key is absent, expired, or stored without expiry.
    #[must_use]
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Purge expired entries every `interval` until `shutdown` fires.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Purged expired cache entries");
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // A writer may have refreshed the key since the read lock was released.
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.entries
            .write()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn value_expires_after_ttl() {
        let cache = InMemoryCache::new();
        cache
            .set("quote:A", "1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.ttl_remaining("quote:A"), Some(Duration::from_secs(60)));
        assert_eq!(cache.get("quote:A").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("quote:A").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("quote:A").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_never_expires() {
        let cache = InMemoryCache::new();
        cache.set("k", "v".to_string(), Duration::ZERO).await.unwrap();

        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(cache.get("k").await.unwrap().is_some());
        assert_eq!(cache.ttl_remaining("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_refreshes_ttl() {
        let cache = InMemoryCache::new();
        cache.set("k", "1".to_string(), Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("k", "2".to_string(), Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired() {
        let cache = InMemoryCache::new();
        cache.set("short", "1".to_string(), Duration::from_secs(1)).await.unwrap();
        cache.set("long", "2".to_string(), Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_purges_until_cancelled() {
        let cache = Arc::new(InMemoryCache::new());
        cache.set("k", "v".to_string(), Duration::from_secs(1)).await.unwrap();

        let shutdown = CancellationToken::new();
        cache.spawn_janitor(Duration::from_secs(5), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(cache.is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn ping_answers() {
        assert!(InMemoryCache::new().ping().await);
    }
}

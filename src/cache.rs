//! Transient correlation cache
//!
//! Short-lived key→value store linking the two legs of a redirect-based
//! flow. The bridge only ever consumes entries through [`CorrelationCache::take`],
//! so a backend shared between processes must implement it as an atomic pop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::Result;

/// Trait abstracting the correlation cache backend.
///
/// Implementations must be `Send + Sync` because one cache is shared by
/// every concurrent flow.
#[async_trait]
pub trait CorrelationCache: Send + Sync + 'static {
    /// Look up a live value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`.
    ///
    /// `None` deletes the key. `ttl` is advisory.
    async fn set(&self, key: &str, value: Option<String>, ttl: Option<Duration>) -> Result<()>;

    /// Store `value` under `key` only if no live value is there.
    ///
    /// Returns `false` and leaves the existing value untouched when the key
    /// is taken. Shared backends must implement this atomically (e.g. `SET NX`).
    async fn set_if_absent(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool>;

    /// Remove `key` if present
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove and return `key` in one step.
    ///
    /// No other caller may observe the value once this returns it.
    async fn take(&self, key: &str) -> Result<Option<String>>;
}

/// Read a JSON value
pub async fn get_json<T, C>(cache: &C, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    C: CorrelationCache + ?Sized,
{
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Atomically consume a JSON value
pub async fn take_json<T, C>(cache: &C, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    C: CorrelationCache + ?Sized,
{
    match cache.take(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Store a value as JSON unless `key` is live; `false` means it was
pub async fn set_json_if_absent<T, C>(
    cache: &C,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<bool>
where
    T: Serialize + ?Sized,
    C: CorrelationCache + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    cache.set_if_absent(key, raw, ttl).await
}

/// A cached value with optional expiry
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Single-process cache backed by a `DashMap`.
///
/// TTLs are honored lazily on access and by [`spawn_reaper`]. Entries live
/// only as long as the process; an in-flight flow is lost on restart.
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of stored entries, expired ones included until reaped
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry
    pub fn reap_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CorrelationCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            // Lazy eviction: remove on access
            self.entries.remove_if(key, |_, e| e.is_expired());
            debug!(key = %key, "Lazy-evicted expired cache entry");
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Option<String>, ttl: Option<Duration>) -> Result<()> {
        match value {
            Some(value) => {
                let entry = CacheEntry {
                    value,
                    expires_at: ttl.map(|t| Instant::now() + t),
                };
                self.entries.insert(key.to_string(), entry);
            }
            None => {
                self.entries.remove(key);
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool> {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        // The shard lock is held for the whole check-and-insert
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired() {
                    return Ok(false);
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .remove(key)
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(_, entry)| entry.value))
    }
}

/// Spawn a background task that reaps expired entries every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    cache: Arc<InMemoryCache>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = cache.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired correlation entries");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Cache reaper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Flow {
        redirect_uri: String,
    }

    #[tokio::test]
    async fn set_then_get() {
        let cache = InMemoryCache::new();
        cache.set("k", Some("v".to_string()), None).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn set_none_deletes() {
        // GIVEN: a stored key
        let cache = InMemoryCache::new();
        cache.set("k", Some("v".to_string()), None).await.unwrap();

        // WHEN: set with no payload
        cache.set("k", None, None).await.unwrap();

        // THEN: the key is gone
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn take_consumes_once() {
        let cache = InMemoryCache::new();
        cache.set("state", Some("flow".to_string()), None).await.unwrap();

        assert_eq!(cache.take("state").await.unwrap().as_deref(), Some("flow"));
        assert!(cache.take("state").await.unwrap().is_none());
        assert!(cache.get("state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        // GIVEN: an entry with a zero TTL
        let cache = InMemoryCache::new();
        cache
            .set("k", Some("v".to_string()), Some(Duration::ZERO))
            .await
            .unwrap();

        // THEN: neither get nor take returns it
        assert!(cache.get("k").await.unwrap().is_none());
        cache
            .set("k2", Some("v".to_string()), Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(cache.take("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_if_absent_keeps_live_value() {
        // GIVEN: a live entry
        let cache = InMemoryCache::new();
        assert!(cache.set_if_absent("k", "first".to_string(), None).await.unwrap());

        // WHEN: a second writer tries the same key
        let inserted = cache.set_if_absent("k", "second".to_string(), None).await.unwrap();

        // THEN: it loses and the first value survives
        assert!(!inserted);
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn set_if_absent_replaces_expired_value() {
        let cache = InMemoryCache::new();
        cache
            .set("k", Some("old".to_string()), Some(Duration::ZERO))
            .await
            .unwrap();

        assert!(cache.set_if_absent("k", "new".to_string(), None).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn concurrent_set_if_absent_yields_single_winner() {
        let cache = Arc::new(InMemoryCache::new());

        let mut handles = Vec::new();
        for i in 0..16 {
            let c = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                c.set_if_absent("state", format!("flow{i}"), None).await.unwrap()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn reap_removes_only_expired() {
        let cache = InMemoryCache::new();
        cache.set("live", Some("1".to_string()), None).await.unwrap();
        cache
            .set("dead", Some("2".to_string()), Some(Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(cache.reap_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_take_yields_single_winner() {
        // GIVEN: one entry and many concurrent consumers
        let cache = Arc::new(InMemoryCache::new());
        cache.set("code", Some("x".to_string()), None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let c = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { c.take("code").await.unwrap() }));
        }

        // THEN: exactly one of them got the value
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn json_helpers_round_trip() {
        let cache = InMemoryCache::new();
        let flow = Flow {
            redirect_uri: "https://app/cb".to_string(),
        };
        assert!(set_json_if_absent(&cache, "s1", &flow, None).await.unwrap());

        let read: Option<Flow> = get_json(&cache, "s1").await.unwrap();
        assert_eq!(read.as_ref(), Some(&flow));

        let taken: Option<Flow> = take_json(&cache, "s1").await.unwrap();
        assert_eq!(taken, Some(flow));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let cache = Arc::new(InMemoryCache::new());
        let (tx, rx) = tokio::sync::broadcast::channel(1);

        let handle = spawn_reaper(Arc::clone(&cache), Duration::from_millis(10), rx);
        cache
            .set("dead", Some("1".to_string()), Some(Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_empty());

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}

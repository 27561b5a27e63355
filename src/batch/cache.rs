//! Embedding cache
//!
//! Vectors are cached under a SHA-256 of model and text. Storage is a
//! pluggable [`CacheBackend`] holding opaque bytes; when an external backend
//! is unreachable the cache switches to an in-process LRU for the rest of the
//! process lifetime instead of failing the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{HypnosError, Result};

/// Key/value store for serialized cache entries
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Batched lookup; backends with a multi-get should override this
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Batched write; backends with pipelining should override this
    async fn set_many(&self, items: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()> {
        for (key, value) in items {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }
}

struct Slot {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Bounded in-process LRU with per-entry TTL
pub struct InMemoryCacheBackend {
    slots: Mutex<LruCache<String, Slot>>,
}

impl InMemoryCacheBackend {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(slots: &mut LruCache<String, Slot>, key: &str, now: Instant) -> Option<Vec<u8>> {
        let expired = match slots.get(key) {
            Some(slot) if slot.expires_at > now => return Some(slot.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            slots.pop(key);
        }
        None
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Self::lookup(&mut slots, key, Instant::now()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.put(
            key.to_string(),
            Slot {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys
            .iter()
            .map(|key| Self::lookup(&mut slots, key, now))
            .collect())
    }

    async fn set_many(&self, items: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in items {
            slots.put(key, Slot { value, expires_at });
        }
        Ok(())
    }
}

/// Serialized form of one cached vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub vector: Vec<f32>,
    pub inserted_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn new(key: String, vector: Vec<f32>, ttl: Duration) -> Self {
        Self {
            key,
            vector,
            inserted_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
        }
    }

    /// Unexpired and of the expected dimension
    pub fn is_usable(&self, now: DateTime<Utc>, dimension: usize) -> bool {
        let age = now.signed_duration_since(self.inserted_at);
        age < chrono::Duration::seconds(self.ttl_secs as i64) && self.vector.len() == dimension
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| HypnosError::DataCorruption(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| HypnosError::DataCorruption(e.to_string()))
    }
}

/// Content-addressed key for a model/text pair
pub fn cache_key(model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Vector cache over a primary backend with in-process fallback
pub struct EmbeddingCache {
    primary: Option<Arc<dyn CacheBackend>>,
    fallback: InMemoryCacheBackend,
    degraded: AtomicBool,
    ttl: Duration,
    dimension: usize,
}

impl EmbeddingCache {
    pub fn new(config: &CacheConfig, dimension: usize, primary: Option<Arc<dyn CacheBackend>>) -> Self {
        Self {
            primary,
            fallback: InMemoryCacheBackend::new(config.max_entries),
            degraded: AtomicBool::new(false),
            ttl: config.ttl,
            dimension,
        }
    }

    /// Cache backed only by the in-process LRU
    pub fn in_memory(config: &CacheConfig, dimension: usize) -> Self {
        Self::new(config, dimension, None)
    }

    /// Whether the primary backend failed and the fallback is in use
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn active(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.primary.as_ref().filter(|_| !self.is_degraded())
    }

    fn degrade(&self, backend: &str, error: &HypnosError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(backend, error = %error, "Cache backend unavailable, using in-process cache");
        }
    }

    /// One lookup round trip for all keys; misses, expired and malformed
    /// entries come back as `None`
    pub async fn get_batch(&self, keys: &[String]) -> Vec<Option<Vec<f32>>> {
        if keys.is_empty() {
            return Vec::new();
        }

        let raw = match self.active() {
            Some(primary) => match primary.get_many(keys).await {
                Ok(values) => values,
                Err(e) => {
                    self.degrade(primary.name(), &e);
                    self.fallback_get(keys).await
                }
            },
            None => self.fallback_get(keys).await,
        };

        let now = Utc::now();
        keys.iter()
            .zip(raw)
            .map(|(key, bytes)| {
                let entry = match CacheEntry::decode(&bytes?) {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!(key = %key, error = %e, "Discarding unreadable cache entry");
                        return None;
                    }
                };
                (entry.key == *key && entry.is_usable(now, self.dimension)).then_some(entry.vector)
            })
            .collect()
    }

    async fn fallback_get(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        // The in-process backend cannot fail
        self.fallback
            .get_many(keys)
            .await
            .unwrap_or_else(|_| vec![None; keys.len()])
    }

    /// One write round trip; empty or wrongly sized vectors are skipped
    pub async fn set_batch(&self, items: &[(String, Vec<f32>)]) {
        let mut encoded = Vec::with_capacity(items.len());
        for (key, vector) in items {
            if vector.is_empty() || vector.len() != self.dimension {
                continue;
            }
            match CacheEntry::new(key.clone(), vector.clone(), self.ttl).encode() {
                Ok(bytes) => encoded.push((key.clone(), bytes)),
                Err(e) => debug!(key = %key, error = %e, "Skipping unencodable cache entry"),
            }
        }
        if encoded.is_empty() {
            return;
        }

        if let Some(primary) = self.active() {
            match primary.set_many(encoded.clone(), self.ttl).await {
                Ok(()) => return,
                Err(e) => self.degrade(primary.name(), &e),
            }
        }
        if let Err(e) = self.fallback.set_many(encoded, self.ttl).await {
            debug!(error = %e, "In-process cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct UnreachableBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CacheBackend for UnreachableBackend {
        fn name(&self) -> &str {
            "redis"
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HypnosError::connection("redis", "connection refused"))
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HypnosError::connection("redis", "connection refused"))
        }
    }

    fn config() -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(60),
            max_entries: 16,
        }
    }

    #[test]
    fn test_cache_key_separates_model_and_text() {
        assert_eq!(cache_key("m", "text"), cache_key("m", "text"));
        assert_ne!(cache_key("m1", "text"), cache_key("m2", "text"));
        assert_ne!(cache_key("ab", "c"), cache_key("a", "bc"));
        assert_eq!(cache_key("m", "t").len(), 64);
    }

    #[tokio::test]
    async fn test_batch_roundtrip() {
        let cache = EmbeddingCache::in_memory(&config(), 3);
        let keys = vec![cache_key("m", "a"), cache_key("m", "b")];

        cache
            .set_batch(&[(keys[0].clone(), vec![1.0, 2.0, 3.0])])
            .await;

        let hits = cache.get_batch(&keys).await;
        assert_eq!(hits, vec![Some(vec![1.0, 2.0, 3.0]), None]);
    }

    #[tokio::test]
    async fn test_wrong_dimension_not_cached() {
        let cache = EmbeddingCache::in_memory(&config(), 3);
        let key = cache_key("m", "a");
        cache.set_batch(&[(key.clone(), vec![1.0, 2.0])]).await;
        cache.set_batch(&[(cache_key("m", "b"), vec![])]).await;
        assert_eq!(cache.get_batch(&[key]).await, vec![None]);
        assert!(cache.fallback.is_empty());
    }

    #[test]
    fn test_expired_entry_unusable() {
        let mut entry = CacheEntry::new("k".into(), vec![0.1; 3], Duration::from_secs(60));
        entry.inserted_at = Utc::now() - chrono::Duration::seconds(61);
        assert!(!entry.is_usable(Utc::now(), 3));

        let fresh = CacheEntry::new("k".into(), vec![0.1; 3], Duration::from_secs(60));
        assert!(fresh.is_usable(Utc::now(), 3));
        assert!(!fresh.is_usable(Utc::now(), 4));
    }

    #[tokio::test]
    async fn test_unreachable_primary_falls_back_silently() {
        let primary = Arc::new(UnreachableBackend {
            calls: AtomicU32::new(0),
        });
        let cache = EmbeddingCache::new(&config(), 2, Some(primary.clone()));
        let key = cache_key("m", "a");

        assert_eq!(cache.get_batch(&[key.clone()]).await, vec![None]);
        assert!(cache.is_degraded());

        cache.set_batch(&[(key.clone(), vec![0.6, 0.8])]).await;
        assert_eq!(cache.get_batch(&[key]).await, vec![Some(vec![0.6, 0.8])]);

        // Fallback is sticky: the primary is not retried
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_ttl() {
        let backend = InMemoryCacheBackend::new(4);
        backend
            .set("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(backend.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(backend.get("k").await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_lru_evicts_oldest() {
        let backend = InMemoryCacheBackend::new(2);
        let ttl = Duration::from_secs(60);
        backend.set("a", vec![1], ttl).await.unwrap();
        backend.set("b", vec![2], ttl).await.unwrap();
        backend.set("c", vec![3], ttl).await.unwrap();

        assert!(backend.get("a").await.unwrap().is_none());
        assert_eq!(backend.len(), 2);
    }
}

//! Read-through/write-through composition of the three cache tiers

use crate::cache::durable::{now_epoch, remaining_lifetime};
use crate::cache::{
    CacheResult, CircuitBreaker, DurableStore, MemoryCache, RedisStore, RemoteStore,
    KEY_NAMESPACE,
};
use crate::config::CacheConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound for connecting to and talking with the networked tier
const REMOTE_TIMEOUT: Duration = Duration::from_secs(2);

/// Value layout stored in the networked tier
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: String,
    #[serde(default)]
    tags: Vec<String>,
    created_at: f64,
    /// Epoch seconds after which the entry is dead; `None` never expires
    #[serde(default)]
    expires_at: Option<f64>,
}

impl Envelope {
    /// Lifetime left for an L1 copy, or `None` when already expired
    fn remaining(&self) -> Option<Option<Duration>> {
        match self.expires_at {
            Some(deadline) => remaining_lifetime(deadline).map(Some),
            None => Some(None),
        }
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,
    pub remote_errors: u64,
    pub l1_entries: usize,
    pub breaker_open: bool,
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l3_hits: AtomicU64,
    misses: AtomicU64,
    remote_errors: AtomicU64,
}

/// Three-tier cache: memory, networked (breaker-guarded), durable
///
/// `get` and `set` never fail. A broken networked or durable tier only
/// shows up in logs and in [`CacheStats`].
pub struct TieredCache {
    memory: Mutex<MemoryCache>,
    remote: Option<Arc<dyn RemoteStore>>,
    durable: Option<DurableStore>,
    breaker: CircuitBreaker,
    counters: Counters,
}

impl TieredCache {
    /// Creates a memory-only cache; attach further tiers with the builders
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            memory: Mutex::new(MemoryCache::new(config.l1_capacity, Some(config.l1_ttl()))),
            remote: None,
            durable: None,
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown()),
            counters: Counters::default(),
        }
    }

    /// Builds every tier the configuration names
    ///
    /// A tier that cannot be opened is logged and left out; the cache still
    /// works with whatever remains.
    pub async fn from_config(config: &CacheConfig) -> Self {
        let mut cache = Self::new(config);

        if let Some(url) = &config.redis_url {
            match RedisStore::connect(url, REMOTE_TIMEOUT).await {
                Ok(store) => cache = cache.with_remote(Arc::new(store)),
                Err(e) => tracing::warn!("Networked cache disabled: {}", e),
            }
        }

        if let Some(path) = &config.durable_path {
            match DurableStore::open(path) {
                Ok(store) => cache = cache.with_durable(store),
                Err(e) => tracing::warn!("Durable cache {} disabled: {}", path.display(), e),
            }
        }

        cache
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_durable(mut self, durable: DurableStore) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, MemoryCache> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remote_key(key: &str) -> String {
        format!("{}{}", KEY_NAMESPACE, key)
    }

    /// The networked tier, if configured and the breaker lets calls through
    fn remote(&self) -> Option<&Arc<dyn RemoteStore>> {
        let remote = self.remote.as_ref()?;
        self.breaker.allow_request().then_some(remote)
    }

    /// Feeds a networked-tier outcome into the breaker
    fn observe<T>(&self, op: &str, key: &str, result: CacheResult<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.breaker.record_success();
                Some(value)
            }
            Err(e) => {
                self.breaker.record_failure();
                self.counters.remote_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Networked cache {} failed for {}: {}", op, key, e);
                None
            }
        }
    }

    /// Looks a key up in L1, then L2, then L3
    ///
    /// Hits in a lower tier are copied into L1 with whatever lifetime they
    /// have left, so a refilled entry never outlives its original TTL.
    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.memory().get(key) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(remote) = self.remote() {
            let fetched = remote.get(&Self::remote_key(key)).await;
            if let Some(Some(raw)) = self.observe("get", key, fetched) {
                match serde_json::from_str::<Envelope>(&raw) {
                    Ok(envelope) => match envelope.remaining() {
                        Some(ttl) => {
                            self.memory()
                                .set(key, envelope.value.clone(), ttl, &envelope.tags);
                            self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                            return Some(envelope.value);
                        }
                        None => tracing::trace!("Networked entry {} already expired", key),
                    },
                    Err(e) => tracing::debug!("Discarding malformed networked entry {}: {}", key, e),
                }
            }
        }

        if let Some(durable) = &self.durable {
            match durable.get_with_ttl(key) {
                Ok(Some((value, ttl))) => {
                    self.memory().set(key, value.clone(), ttl, &[]);
                    self.counters.l3_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Durable cache read failed for {}: {}", key, e),
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Writes a value to every available tier
    ///
    /// # Arguments
    ///
    /// * `key` - Cache key; tag invalidation in L2/L3 matches `{tag}:` prefixes
    /// * `value` - Value to store
    /// * `ttl` - Expiry; `None` uses the L1 default in memory and never expires below
    /// * `tags` - Labels for [`TieredCache::invalidate_by_tags`]
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>, tags: &[String]) {
        self.memory().set(key, value.to_string(), ttl, tags);

        if let Some(remote) = self.remote() {
            let created_at = now_epoch();
            let envelope = Envelope {
                value: value.to_string(),
                tags: tags.to_vec(),
                created_at,
                expires_at: ttl.map(|ttl| created_at + ttl.as_secs_f64()),
            };
            match serde_json::to_string(&envelope) {
                Ok(raw) => {
                    let written = remote.set(&Self::remote_key(key), &raw, ttl).await;
                    self.observe("set", key, written);
                }
                Err(e) => tracing::warn!("Cannot encode networked entry {}: {}", key, e),
            }
        }

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.set(key, value, ttl) {
                tracing::warn!("Durable cache write failed for {}: {}", key, e);
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!("Cached value for {} does not decode: {}", key, e);
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[String],
    ) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl, tags).await,
            Err(e) => tracing::warn!("Cannot encode cache value for {}: {}", key, e),
        }
    }

    /// Removes a key from every tier
    pub async fn delete(&self, key: &str) {
        self.memory().remove(key);

        if let Some(remote) = self.remote() {
            let deleted = remote.delete(&Self::remote_key(key)).await;
            self.observe("delete", key, deleted);
        }

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.delete(key) {
                tracing::warn!("Durable cache delete failed for {}: {}", key, e);
            }
        }
    }

    /// Drops every entry carrying any of `tags`
    ///
    /// L1 is matched on the tags stored with each entry. L2 and L3 do not
    /// index tags, so keys under the `{tag}:` prefix are removed there.
    ///
    /// # Returns
    ///
    /// The number of L1 entries removed
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        let removed = self.memory().invalidate_by_tags(tags);

        for tag in tags {
            let prefix = format!("{}:", tag);

            if let Some(remote) = self.remote() {
                let pattern = format!("{}{}*", KEY_NAMESPACE, prefix);
                let scanned = remote.scan(&pattern).await;
                for key in self.observe("scan", &pattern, scanned).unwrap_or_default() {
                    let deleted = remote.delete(&key).await;
                    if self.observe("delete", &key, deleted).is_none() {
                        break;
                    }
                }
            }

            if let Some(durable) = &self.durable {
                if let Err(e) = durable.delete_prefix(&prefix) {
                    tracing::warn!("Durable cache invalidation failed for tag {}: {}", tag, e);
                }
            }
        }

        tracing::debug!("Invalidated {} memory entries for tags {:?}", removed, tags);
        removed
    }

    /// Empties L1 only
    pub fn clear_memory(&self) {
        self.memory().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            l3_hits: self.counters.l3_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            remote_errors: self.counters.remote_errors.load(Ordering::Relaxed),
            l1_entries: self.memory().len(),
            breaker_open: self.breaker.is_open(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryRemote;

    fn config() -> CacheConfig {
        CacheConfig {
            breaker_threshold: 3,
            breaker_cooldown_secs: 60,
            ..CacheConfig::default()
        }
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_memory_only_roundtrip() {
        let cache = TieredCache::new(&config());
        cache.set("k", "v", None, &[]).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(cache.get("missing").await, None);

        let stats = cache.stats();
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_across_tiers() {
        let remote = Arc::new(InMemoryRemote::new());
        let cache = TieredCache::new(&config())
            .with_remote(remote)
            .with_durable(DurableStore::open_in_memory().unwrap());

        cache.set("k", "v", Some(Duration::from_secs(1)), &[]).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_durable_refill_keeps_original_expiry() {
        let cache = TieredCache::new(&config()).with_durable(DurableStore::open_in_memory().unwrap());
        cache.set("k", "v", Some(Duration::from_secs(1)), &[]).await;
        cache.clear_memory();

        // Served from L3 and copied into L1
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(cache.stats().l3_hits, 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.stats().l1_entries, 0);
    }

    #[tokio::test]
    async fn test_remote_refill_keeps_original_expiry() {
        let remote = Arc::new(InMemoryRemote::new());
        let writer = TieredCache::new(&config()).with_remote(remote.clone());
        writer.set("k", "v", Some(Duration::from_secs(1)), &[]).await;

        let reader = TieredCache::new(&config()).with_remote(remote);
        assert_eq!(reader.get("k").await.as_deref(), Some("v"));
        assert_eq!(reader.stats().l2_hits, 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(reader.get("k").await, None);
    }

    #[tokio::test]
    async fn test_expired_envelope_is_a_miss() {
        let remote = Arc::new(InMemoryRemote::new());
        let stale = Envelope {
            value: "v".to_string(),
            tags: Vec::new(),
            created_at: now_epoch() - 10.0,
            expires_at: Some(now_epoch() - 5.0),
        };
        remote
            .set(
                &TieredCache::remote_key("k"),
                &serde_json::to_string(&stale).unwrap(),
                None,
            )
            .await
            .unwrap();

        let cache = TieredCache::new(&config()).with_remote(remote);
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_remote_hit_populates_memory() {
        let remote = Arc::new(InMemoryRemote::new());
        let writer = TieredCache::new(&config()).with_remote(remote.clone());
        writer.set("probe:h:443", "{}", None, &tags(&["probe"])).await;

        let reader = TieredCache::new(&config()).with_remote(remote);
        assert_eq!(reader.get("probe:h:443").await.as_deref(), Some("{}"));
        assert_eq!(reader.get("probe:h:443").await.as_deref(), Some("{}"));

        let stats = reader.stats();
        assert_eq!(stats.l2_hits, 1);
        assert_eq!(stats.l1_hits, 1);

        // Tags travel with the networked entry
        assert_eq!(reader.invalidate_by_tags(&tags(&["probe"])).await, 1);
    }

    #[tokio::test]
    async fn test_durable_fallback() {
        let cache = TieredCache::new(&config()).with_durable(DurableStore::open_in_memory().unwrap());
        cache.set("k", "v", None, &[]).await;
        cache.clear_memory();

        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(cache.stats().l3_hits, 1);
    }

    #[tokio::test]
    async fn test_remote_failures_open_breaker_without_failing_calls() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.set_failing(true);
        let cache = TieredCache::new(&config())
            .with_remote(remote.clone())
            .with_durable(DurableStore::open_in_memory().unwrap());

        for i in 0..3 {
            cache.set(&format!("k{}", i), "v", None, &[]).await;
        }
        assert!(cache.breaker().is_open());
        let calls = remote.call_count();

        // Open breaker: networked tier is skipped entirely
        cache.set("k3", "v", None, &[]).await;
        cache.clear_memory();
        assert_eq!(cache.get("k3").await.as_deref(), Some("v"));
        assert_eq!(remote.call_count(), calls);
        assert_eq!(cache.stats().l3_hits, 1);
    }

    #[tokio::test]
    async fn test_breaker_recovers_after_cooldown() {
        let config = CacheConfig {
            breaker_threshold: 3,
            breaker_cooldown_secs: 0,
            ..CacheConfig::default()
        };
        let remote = Arc::new(InMemoryRemote::new());
        remote.set_failing(true);
        let cache = TieredCache::new(&config).with_remote(remote.clone());

        for _ in 0..3 {
            cache.set("k", "v", None, &[]).await;
        }
        assert!(cache.breaker().is_open());

        remote.set_failing(false);
        cache.set("k", "v", None, &[]).await;
        assert!(!cache.breaker().is_open());
        assert_eq!(cache.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_by_tags_reaches_every_tier() {
        let remote = Arc::new(InMemoryRemote::new());
        let cache = TieredCache::new(&config())
            .with_remote(remote.clone())
            .with_durable(DurableStore::open_in_memory().unwrap());

        cache.set("probe:a:1", "x", None, &tags(&["probe"])).await;
        cache.set("probe:b:2", "x", None, &tags(&["probe"])).await;
        cache.set("source:s", "x", None, &tags(&["source"])).await;

        assert_eq!(cache.invalidate_by_tags(&tags(&["probe"])).await, 2);
        assert_eq!(remote.len(), 1);

        cache.clear_memory();
        assert_eq!(cache.get("probe:a:1").await, None);
        assert_eq!(cache.get("source:s").await.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_delete_and_json_helpers() {
        let cache = TieredCache::new(&config()).with_durable(DurableStore::open_in_memory().unwrap());
        cache.set_json("n", &vec![1, 2, 3], None, &[]).await;
        assert_eq!(cache.get_json::<Vec<i32>>("n").await, Some(vec![1, 2, 3]));

        cache.delete("n").await;
        assert_eq!(cache.get_json::<Vec<i32>>("n").await, None);
    }
}

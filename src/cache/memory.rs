//! In-memory LRU cache with per-entry TTL and tags

use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// A cached value and its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: String,
    pub ttl: Option<Duration>,
    pub created_at: Instant,
    pub access_count: u64,
    pub tags: Vec<String>,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| self.created_at.elapsed() >= ttl)
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        self.tags.iter().any(|t| tags.contains(t))
    }
}

/// Bounded LRU cache
///
/// Expired entries are removed lazily on access.
pub struct MemoryCache {
    entries: LruCache<String, CacheEntry>,
    default_ttl: Option<Duration>,
}

impl MemoryCache {
    /// Creates a cache holding at most `capacity` entries
    ///
    /// `default_ttl` applies to entries stored without an explicit TTL.
    pub fn new(capacity: usize, default_ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            default_ttl,
        }
    }

    /// Returns the value for `key`, refreshing its recency
    pub fn get(&mut self, key: &str) -> Option<String> {
        if self.entries.peek(key)?.is_expired() {
            self.entries.pop(key);
            return None;
        }

        let entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        Some(entry.value.clone())
    }

    /// Inspects an entry without touching recency or counters
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.peek(key).filter(|entry| !entry.is_expired())
    }

    /// Stores a value, evicting the least recently used entry when full
    pub fn set(&mut self, key: &str, value: String, ttl: Option<Duration>, tags: &[String]) {
        let entry = CacheEntry {
            value,
            ttl: ttl.or(self.default_ttl),
            created_at: Instant::now(),
            access_count: 0,
            tags: tags.to_vec(),
        };

        if let Some((evicted, _)) = self.entries.push(key.to_string(), entry) {
            if evicted != key {
                tracing::trace!("Evicted {} from memory cache", evicted);
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.pop(key).is_some()
    }

    fn remove_where(&mut self, doomed: impl Fn(&CacheEntry) -> bool) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| doomed(*entry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            self.entries.pop(key);
        }
        keys.len()
    }

    /// Removes every entry carrying any of `tags`
    ///
    /// # Returns
    ///
    /// The number of entries removed
    pub fn invalidate_by_tags(&mut self, tags: &[String]) -> usize {
        self.remove_where(|entry| entry.has_any_tag(tags))
    }

    /// Drops every expired entry
    pub fn purge_expired(&mut self) -> usize {
        self.remove_where(CacheEntry::is_expired)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_set_and_get() {
        let mut cache = MemoryCache::new(4, None);
        cache.set("k", "v".to_string(), None, &[]);
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let mut cache = MemoryCache::new(4, None);
        cache.set("k", "v".to_string(), Some(Duration::from_millis(50)), &[]);
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        sleep(Duration::from_millis(80));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_default_ttl_applies() {
        let mut cache = MemoryCache::new(4, Some(Duration::from_millis(30)));
        cache.set("k", "v".to_string(), None, &[]);
        sleep(Duration::from_millis(50));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut cache = MemoryCache::new(2, None);
        cache.set("a", "1".to_string(), None, &[]);
        cache.set("b", "2".to_string(), None, &[]);

        // "a" becomes most recently used, so "b" is evicted next
        assert!(cache.get("a").is_some());
        cache.set("c", "3".to_string(), None, &[]);

        assert_eq!(cache.len(), 2);
        assert!(cache.peek("b").is_none());
        assert!(cache.peek("a").is_some());
        assert!(cache.peek("c").is_some());
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let mut cache = MemoryCache::new(2, None);
        cache.set("a", "1".to_string(), None, &[]);
        cache.set("b", "2".to_string(), None, &[]);
        cache.set("a", "10".to_string(), None, &[]);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").as_deref(), Some("10"));
        assert_eq!(cache.get("b").as_deref(), Some("2"));
    }

    #[test]
    fn test_access_count() {
        let mut cache = MemoryCache::new(2, None);
        cache.set("a", "1".to_string(), None, &[]);
        cache.get("a");
        cache.get("a");
        assert_eq!(cache.peek("a").unwrap().access_count, 2);
    }

    #[test]
    fn test_invalidate_by_tags() {
        let mut cache = MemoryCache::new(8, None);
        cache.set("p1", "x".to_string(), None, &tags(&["probe"]));
        cache.set("p2", "x".to_string(), None, &tags(&["probe", "eu"]));
        cache.set("s1", "x".to_string(), None, &tags(&["source"]));
        cache.set("n", "x".to_string(), None, &[]);

        assert_eq!(cache.invalidate_by_tags(&tags(&["probe"])), 2);
        assert!(cache.peek("p1").is_none());
        assert!(cache.peek("p2").is_none());
        assert!(cache.peek("s1").is_some());
        assert!(cache.peek("n").is_some());
    }

    #[test]
    fn test_purge_expired() {
        let mut cache = MemoryCache::new(8, None);
        cache.set("short", "x".to_string(), Some(Duration::from_millis(20)), &[]);
        cache.set("long", "x".to_string(), Some(Duration::from_secs(60)), &[]);
        sleep(Duration::from_millis(40));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_capacity_holds_one_entry() {
        let mut cache = MemoryCache::new(0, None);
        assert_eq!(cache.capacity(), 1);
        cache.set("a", "1".to_string(), None, &[]);
        cache.set("b", "2".to_string(), None, &[]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b").as_deref(), Some("2"));
    }
}

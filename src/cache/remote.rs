//! Networked cache tier
//!
//! [`RemoteStore`] is the seam between the tiered cache and whatever
//! key/value service backs L2. [`RedisStore`] talks to Redis through a
//! reconnecting connection manager; [`InMemoryRemote`] is a process-local
//! stand-in with switchable failure injection.

use crate::cache::{CacheError, CacheResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Prefix applied to every key the tiered cache writes to L2
pub const KEY_NAMESPACE: &str = "submerge:";

/// Keys fetched per SCAN round trip
const SCAN_BATCH: usize = 200;

/// Checks a key against a glob pattern where `*` matches any run of characters
///
/// # Examples
///
/// ```
/// use submerge::cache::matches_pattern;
///
/// assert!(matches_pattern("submerge:probe:*", "submerge:probe:1.2.3.4:443"));
/// assert!(matches_pattern("*:443", "submerge:probe:1.2.3.4:443"));
/// assert!(!matches_pattern("submerge:probe:*", "submerge:source:x"));
/// ```
pub fn matches_pattern(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let [first, middle @ .., last] = parts.as_slice() else {
        return pattern == key;
    };

    if key.len() < first.len() + last.len() || !key.starts_with(first) || !key.ends_with(last) {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    true
}

/// Key/value operations required from the networked tier
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Stores `value`, expiring it after `ttl` when given
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Lists keys matching a glob pattern
    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>>;
}

/// Redis-backed networked tier
pub struct RedisStore {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connects to Redis
    ///
    /// # Arguments
    ///
    /// * `url` - A `redis://` or `rediss://` connection URL
    /// * `op_timeout` - Upper bound for the initial connection and each command
    pub async fn connect(url: &str, op_timeout: Duration) -> CacheResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Remote(format!("connection to {} timed out", url)))??;

        tracing::info!("Connected to networked cache at {}", url);
        Ok(Self {
            manager,
            op_timeout,
        })
    }

    async fn run<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> CacheResult<T> {
        let mut conn = self.manager.clone();
        tokio::time::timeout(self.op_timeout, cmd.query_async::<_, T>(&mut conn))
            .await
            .map_err(|_| CacheError::Remote("command timed out".to_string()))?
            .map_err(CacheError::from)
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        self.run::<()>(cmd).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run::<i64>(cmd).await.map(|_| ())
    }

    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) = self.run(cmd).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

/// Process-local networked tier stand-in
///
/// Every call fails with [`CacheError::Remote`] while failure injection is
/// switched on.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of operations attempted, including failed ones
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> CacheResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Remote("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check()?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match entries.get(key) {
            Some((_, Some(deadline))) => Instant::now() >= *deadline,
            Some((_, None)) => false,
            None => return Ok(None),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.check()?;
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.check()?;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.check()?;
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| matches_pattern(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_exact() {
        assert!(matches_pattern("a:b", "a:b"));
        assert!(!matches_pattern("a:b", "a:bc"));
    }

    #[test]
    fn test_pattern_wildcards() {
        assert!(matches_pattern("*", ""));
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("submerge:probe:*", "submerge:probe:h:1"));
        assert!(matches_pattern("submerge:*:443", "submerge:probe:h:443"));
        assert!(matches_pattern("a*b*c", "a-x-b-y-c"));
        assert!(!matches_pattern("a*b*c", "a-x-c-y-b"));
        assert!(!matches_pattern("ab*ba", "aba"));
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let remote = InMemoryRemote::new();
        remote.set("k", "v", None).await.unwrap();
        assert_eq!(remote.get("k").await.unwrap().as_deref(), Some("v"));

        remote.delete("k").await.unwrap();
        assert_eq!(remote.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_in_memory_ttl() {
        let remote = InMemoryRemote::new();
        remote
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(remote.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_in_memory_scan() {
        let remote = InMemoryRemote::new();
        for key in ["submerge:probe:a:1", "submerge:probe:b:2", "submerge:other:c"] {
            remote.set(key, "x", None).await.unwrap();
        }
        let keys = remote.scan("submerge:probe:*").await.unwrap();
        assert_eq!(keys, vec!["submerge:probe:a:1", "submerge:probe:b:2"]);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let remote = InMemoryRemote::new();
        remote.set_failing(true);
        assert!(matches!(remote.get("k").await, Err(CacheError::Remote(_))));
        assert!(remote.set("k", "v", None).await.is_err());
        assert_eq!(remote.call_count(), 2);

        remote.set_failing(false);
        assert!(remote.set("k", "v", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_redis_connect_failure_is_reported() {
        let result = RedisStore::connect("redis://127.0.0.1:1/", Duration::from_millis(500)).await;
        assert!(result.is_err());
    }
}

//! SQLite-backed durable cache tier

use crate::cache::schema::initialize_schema;
use crate::cache::CacheResult;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Seconds since the Unix epoch, with millisecond precision
pub(crate) fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Time left until the epoch-seconds deadline `expires_at`, `None` once passed
pub(crate) fn remaining_lifetime(expires_at: f64) -> Option<Duration> {
    let left = expires_at - now_epoch();
    (left > 0.0).then(|| Duration::from_secs_f64(left))
}

/// Durable key/value store with optional expiry
pub struct DurableStore {
    conn: Mutex<Connection>,
}

impl DurableStore {
    /// Opens or creates the store and drops already-expired rows
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(DurableStore)` - Successfully opened/created database
    /// * `Err(CacheError)` - Failed to open database
    pub fn open(path: &Path) -> CacheResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        let pruned = store.prune_expired()?;
        if pruned > 0 {
            tracing::info!("Pruned {} expired durable cache entries", pruned);
        }

        Ok(store)
    }

    /// Creates an in-memory store (for testing)
    pub fn open_in_memory() -> CacheResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the stored value, treating expired rows as absent
    pub fn get(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.get_with_ttl(key)?.map(|(value, _)| value))
    }

    /// Returns the stored value and how long it has left to live
    ///
    /// `None` as lifetime means the row never expires.
    pub fn get_with_ttl(&self, key: &str) -> CacheResult<Option<(String, Option<Duration>)>> {
        let conn = self.lock();
        let row: Option<(Option<String>, Option<f64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM cache_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((value, expires_at)) = row else {
            return Ok(None);
        };

        match expires_at.map(remaining_lifetime) {
            Some(None) => {
                conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                Ok(None)
            }
            Some(Some(left)) => Ok(value.map(|value| (value, Some(left)))),
            None => Ok(value.map(|value| (value, None))),
        }
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let expires_at = ttl.map(|ttl| now_epoch() + ttl.as_secs_f64());
        self.lock().execute(
            "INSERT OR REPLACE INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed = self
            .lock()
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    /// Deletes every key starting with `prefix`
    pub fn delete_prefix(&self, prefix: &str) -> CacheResult<usize> {
        let removed = self.lock().execute(
            "DELETE FROM cache_entries WHERE substr(key, 1, ?2) = ?1",
            params![prefix, prefix.chars().count() as i64],
        )?;
        Ok(removed)
    }

    /// Deletes rows whose expiry has passed
    pub fn prune_expired(&self) -> CacheResult<usize> {
        let removed = self.lock().execute(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now_epoch()],
        )?;
        Ok(removed)
    }

    pub fn len(&self) -> CacheResult<usize> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }
}

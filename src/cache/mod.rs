//! Tiered cache
//!
//! Three layers consulted in order:
//!
//! 1. [`MemoryCache`] (L1): bounded, per-entry TTL, strict LRU eviction
//! 2. [`RemoteStore`] (L2): networked key/value store, guarded by a
//!    [`CircuitBreaker`] and never authoritative
//! 3. [`DurableStore`] (L3): SQLite fallback that survives restarts
//!
//! Tier failures are logged and absorbed; [`TieredCache`] never returns
//! them to its callers.

mod breaker;
mod durable;
mod memory;
mod remote;
mod schema;
mod tiered;

pub use breaker::CircuitBreaker;
pub use durable::DurableStore;
pub use memory::{CacheEntry, MemoryCache};
pub use remote::{matches_pattern, InMemoryRemote, RedisStore, RemoteStore, KEY_NAMESPACE};
pub use schema::{initialize_schema, SCHEMA_SQL};
pub use tiered::{CacheStats, TieredCache};

use thiserror::Error;

/// Errors raised by individual cache tiers
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Remote tier error: {0}")]
    Remote(String),

    #[error("Durable tier error: {0}")]
    Durable(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::Remote(err.to_string())
    }
}

/// Result type for cache tier operations
pub type CacheResult<T> = Result<T, CacheError>;

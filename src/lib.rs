//! Submerge: a subscription aggregator for proxy endpoint descriptors
//!
//! This crate fetches subscription lists from many remote sources, parses
//! every descriptor into a canonical endpoint record, drops semantic
//! duplicates, probes reachability, and ranks what survives.

pub mod cache;
pub mod config;
pub mod dedup;
pub mod fetcher;
pub mod probe;
pub mod protocol;
pub mod scoring;

use thiserror::Error;

/// Main error type for Submerge operations
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Descriptor error: {0}")]
    Parse(#[from] ParseError),

    #[error("Cache error: {0}")]
    Cache(#[from] cache::CacheError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] fetcher::FetchError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Descriptor parsing errors
///
/// Every variant means the candidate is dropped; none of them abort a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Invalid {scheme} descriptor: {reason}")]
    InvalidFormat { scheme: String, reason: String },

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Missing required field '{field}' in {scheme} descriptor")]
    MissingField { scheme: String, field: &'static str },

    #[error("Port out of range in {scheme} descriptor: {port}")]
    InvalidPort { scheme: String, port: i64 },
}

impl ParseError {
    /// Shorthand for an `InvalidFormat` error
    pub fn invalid(scheme: &str, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            scheme: scheme.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a `MissingField` error
    pub fn missing(scheme: &str, field: &'static str) -> Self {
        Self::MissingField {
            scheme: scheme.to_string(),
            field,
        }
    }
}

/// Result type alias for Submerge operations
pub type Result<T> = std::result::Result<T, MergeError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for descriptor parsing
pub type ParseResult<T> = std::result::Result<T, ParseError>;

// Re-export commonly used types
pub use config::{Config, SourceRef, SourceTier};
pub use dedup::{fingerprint, Deduplicator, SemanticFingerprint};
pub use fetcher::{Coordinator, PipelineOutcome, RunStats, ScoredEndpoint};
pub use probe::{Prober, ReachabilityCheck, ReachabilityResult};
pub use protocol::{normalize, NormalizedEndpoint, Protocol};
pub use scoring::{HeuristicScorer, Scorer};

//! Configuration module for Submerge
//!
//! This module handles loading, parsing, and validating the TOML
//! configuration file and the subscription source list.
//!
//! # Example
//!
//! ```no_run
//! use submerge::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("submerge.toml")).unwrap();
//! println!("Retrying each source {} times", config.fetch.retry_attempts);
//! ```

mod parser;
mod sources;
mod types;
mod validation;

// Re-export types
pub use sources::{fallback_sources, load_sources, parse_sources, SourceRef, SourceTier, FALLBACK_SOURCES};
pub use types::{CacheConfig, Config, FetchConfig, OutputConfig, ProbeConfig};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;

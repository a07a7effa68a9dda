use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for Submerge
///
/// Built once at startup and shared read-only with every component.
/// All sections are optional; missing keys take their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fetch: FetchConfig,
    pub probe: ProbeConfig,
    pub cache: CacheConfig,
    pub output: OutputConfig,
}

/// Source retrieval configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FetchConfig {
    /// Maximum number of sources fetched at once
    pub concurrency: usize,

    /// Per-request timeout (seconds)
    pub timeout_secs: u64,

    /// Total attempts per source, including the first one
    pub retry_attempts: u32,

    /// Delay before the first retry (milliseconds); doubles every attempt
    pub retry_base_delay_ms: u64,

    /// Upper bound for a single retry delay (milliseconds)
    pub retry_max_delay_ms: u64,

    /// Lines considered per source document
    pub max_lines_per_source: usize,

    /// Shortest candidate line kept
    pub min_line_length: usize,

    /// Longest candidate line kept
    pub max_line_length: usize,

    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            timeout_secs: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            max_lines_per_source: 50_000,
            min_line_length: 10,
            max_line_length: 4096,
            user_agent: format!("submerge/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

/// Reachability probing configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProbeConfig {
    /// Whether endpoints are TCP-probed at all
    pub enabled: bool,

    /// Connect timeout per probe (milliseconds)
    pub timeout_ms: u64,

    /// Maximum probes in flight across all sources
    pub concurrency: usize,

    /// Optional MaxMind country database
    pub geoip_database: Option<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 2000,
            concurrency: 64,
            geoip_database: None,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Tiered cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Maximum entries held in memory
    pub l1_capacity: usize,

    /// Default entry TTL (seconds)
    pub l1_ttl_secs: u64,

    /// TTL for cached probe results (seconds)
    pub probe_ttl_secs: u64,

    /// Redis URL for the networked tier; the tier is disabled when absent
    pub redis_url: Option<String>,

    /// SQLite file for the durable tier; the tier is disabled when absent
    pub durable_path: Option<PathBuf>,

    /// Consecutive networked-tier failures before the breaker opens
    pub breaker_threshold: u32,

    /// How long the breaker stays open before a trial call (seconds)
    pub breaker_cooldown_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 10_000,
            l1_ttl_secs: 3600,
            probe_ttl_secs: 1800,
            redis_url: None,
            durable_path: None,
            breaker_threshold: 5,
            breaker_cooldown_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn l1_ttl(&self) -> Duration {
        Duration::from_secs(self.l1_ttl_secs)
    }

    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_ttl_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

/// Result selection configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Keep at most this many endpoints (0 = unlimited)
    pub max_results: usize,

    /// Drop endpoints scoring below this value
    pub min_score: f64,

    /// Only keep these protocol tags (empty = all)
    pub include_protocols: Vec<String>,

    /// Drop these protocol tags
    pub exclude_protocols: Vec<String>,
}

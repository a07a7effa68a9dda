//! Subscription source list loading
//!
//! Sources come from a newline-delimited file. Each line holds one URL and
//! may be followed by a tier label separated by whitespace. Blank lines and
//! `#` comments are skipped.

use crate::ConfigError;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use url::Url;

/// Used when no source file is given or it lists nothing usable
pub const FALLBACK_SOURCES: &[&str] = &[
    "https://raw.githubusercontent.com/barry-far/V2ray-Configs/main/All_Configs_Sub.txt",
    "https://raw.githubusercontent.com/mahdibland/V2RayAggregator/master/sub/sub_merge.txt",
    "https://raw.githubusercontent.com/Epodonios/v2ray-configs/main/All_Configs_Sub.txt",
    "https://raw.githubusercontent.com/soroushmirzaei/telegram-configs-collector/main/splitted/mixed",
];

/// Trust tier of a subscription source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SourceTier {
    Premium,
    Reliable,
    #[default]
    Default,
    Bulk,
    Experimental,
}

impl SourceTier {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "premium" => Some(Self::Premium),
            "reliable" => Some(Self::Reliable),
            "default" => Some(Self::Default),
            "bulk" => Some(Self::Bulk),
            "experimental" => Some(Self::Experimental),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Premium => "premium",
            Self::Reliable => "reliable",
            Self::Default => "default",
            Self::Bulk => "bulk",
            Self::Experimental => "experimental",
        }
    }

    /// Reliability weight in `[0, 1]` handed to the scorer
    pub fn reliability(&self) -> f64 {
        match self {
            Self::Premium => 1.0,
            Self::Reliable => 0.8,
            Self::Default => 0.5,
            Self::Bulk => 0.3,
            Self::Experimental => 0.2,
        }
    }

    /// Lower is fetched first
    pub fn priority(&self) -> u8 {
        match self {
            Self::Premium => 0,
            Self::Reliable => 1,
            Self::Default => 2,
            Self::Bulk => 3,
            Self::Experimental => 4,
        }
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One subscription URL and its tier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub url: String,
    pub tier: SourceTier,
    pub priority: u8,
}

impl SourceRef {
    pub fn new(url: impl Into<String>, tier: SourceTier) -> Self {
        Self {
            url: url.into(),
            tier,
            priority: tier.priority(),
        }
    }

    pub fn reliability(&self) -> f64 {
        self.tier.reliability()
    }
}

/// Loads the source list, falling back to [`FALLBACK_SOURCES`]
///
/// # Arguments
///
/// * `path` - Optional path to a newline-delimited source file
///
/// # Returns
///
/// * `Ok(Vec<SourceRef>)` - Sources ordered by priority, duplicates removed
/// * `Err(ConfigError)` - The file exists but could not be read
pub fn load_sources(path: Option<&Path>) -> Result<Vec<SourceRef>, ConfigError> {
    let sources = match path {
        Some(path) => parse_sources(&std::fs::read_to_string(path)?),
        None => Vec::new(),
    };

    if sources.is_empty() {
        tracing::info!(
            "No usable sources configured, using {} built-in sources",
            FALLBACK_SOURCES.len()
        );
        return Ok(fallback_sources());
    }

    Ok(sources)
}

/// Parses a newline-delimited source list
///
/// Invalid URLs are skipped with a warning. Duplicate URLs keep their first
/// occurrence. The result is stably sorted by tier priority.
pub fn parse_sources(content: &str) -> Vec<SourceRef> {
    let mut seen = HashSet::new();
    let mut sources = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let Some(url) = parts.next() else {
            continue;
        };

        let tier = match parts.next() {
            Some(label) => SourceTier::from_label(label).unwrap_or_else(|| {
                tracing::warn!("Unknown source tier '{}' for {}, using default", label, url);
                SourceTier::Default
            }),
            None => SourceTier::Default,
        };

        match Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => {
                tracing::warn!("Skipping source with scheme '{}': {}", parsed.scheme(), url);
                continue;
            }
            Err(e) => {
                tracing::warn!("Skipping invalid source URL {}: {}", url, e);
                continue;
            }
        }

        if seen.insert(url.to_string()) {
            sources.push(SourceRef::new(url, tier));
        }
    }

    sources.sort_by_key(|s| s.priority);
    sources
}

pub fn fallback_sources() -> Vec<SourceRef> {
    FALLBACK_SOURCES
        .iter()
        .map(|url| SourceRef::new(*url, SourceTier::Default))
        .collect()
}

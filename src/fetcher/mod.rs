//! Source retrieval and pipeline orchestration
//!
//! This module contains:
//! - The HTTP client and the retrying source fetch
//! - Payload decoding and candidate line extraction
//! - The [`Coordinator`] that drives every candidate through
//!   normalize → dedup → probe → score

mod client;
mod coordinator;
mod payload;

pub use client::{build_http_client, fetch_source, BackoffPolicy, FetchedDocument};
pub use coordinator::{
    rank, Coordinator, PipelineOutcome, ProtocolFilter, RunStats, ScoredEndpoint, SourceFailure,
    PROBE_CACHE_TAG,
};
pub use payload::{
    decode_payload, extract_candidates, maybe_decode_subscription, ExtractedLines, RawCandidate,
};

use thiserror::Error;

/// Why a single fetch attempt failed
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    /// Failures another attempt cannot fix: redirect loops, invalid
    /// requests, undecodable bodies
    #[error("Request to {url} cannot succeed: {reason}")]
    Permanent { url: String, reason: String },
}

impl FetchError {
    /// Classifies a reqwest error for `url`
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            Self::Timeout { url }
        } else if err.is_connect() {
            Self::Connect {
                url,
                reason: err.to_string(),
            }
        } else if err.is_redirect() || err.is_builder() || err.is_decode() {
            Self::Permanent {
                url,
                reason: err.to_string(),
            }
        } else {
            Self::Request {
                url,
                reason: err.to_string(),
            }
        }
    }

    /// Whether another attempt may succeed
    ///
    /// | Condition | Retried |
    /// |-----------|---------|
    /// | Timeout, connection error, body cut short | yes |
    /// | HTTP 5xx | yes |
    /// | HTTP 429 | yes |
    /// | Other HTTP 4xx | no |
    /// | Too many redirects, invalid request, undecodable body | no |
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connect { .. } | Self::Request { .. } => true,
            Self::Permanent { .. } => false,
            Self::Status { status, .. } => *status == 429 || (500..=599).contains(status),
        }
    }
}

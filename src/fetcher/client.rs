//! HTTP client and retrying source fetch

use crate::config::FetchConfig;
use crate::fetcher::FetchError;
use rand::Rng;
use reqwest::{redirect::Policy, Client};
use std::time::Duration;

/// Redirect hops followed per request
const MAX_REDIRECTS: usize = 10;

/// Builds the HTTP client shared by every source fetch
///
/// Responses are transparently decompressed when the server sends gzip or
/// brotli content encoding.
///
/// # Arguments
///
/// * `config` - Fetch configuration (user agent and timeouts)
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &FetchConfig) -> Result<Client, reqwest::Error> {
    let timeout = config.timeout();

    Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Exponential backoff with additive jitter
///
/// The delay before retry `n` (1-based) is
/// `min(base * 2^(n-1) + jitter, max)` with jitter drawn from
/// `[0, base / 4]`. Because doubling always adds at least `base`, delays
/// never shrink from one retry to the next.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: true,
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(config.retry_base_delay(), config.retry_max_delay())
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait after failed attempt number `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.base.as_millis() as u64;
        let exponential = base_ms.saturating_mul(1u64 << exponent);

        let jitter = if self.jitter && base_ms >= 4 {
            rand::rng().random_range(0..=base_ms / 4)
        } else {
            0
        };

        Duration::from_millis(exponential.saturating_add(jitter)).min(self.max)
    }
}

/// A successfully retrieved source document
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub url: String,
    pub status: u16,
    pub body: String,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

async fn fetch_once(client: &Client, url: &str) -> Result<(u16, String), FetchError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let body = response
        .text()
        .await
        .map_err(|e| FetchError::from_reqwest(url, e))?;

    Ok((status.as_u16(), body))
}

/// Fetches a source document, retrying transient failures
///
/// # Retry Logic
///
/// | Condition | Action |
/// |-----------|--------|
/// | HTTP 2xx | Return the body |
/// | HTTP 5xx, 429, timeout, connection error | Back off and retry |
/// | Other HTTP 4xx | Fail immediately |
///
/// # Arguments
///
/// * `client` - The HTTP client to use
/// * `url` - The source URL
/// * `max_attempts` - Total attempts, including the first
/// * `backoff` - Delay policy between attempts
///
/// # Returns
///
/// The document, or the error from the last attempt
pub async fn fetch_source(
    client: &Client,
    url: &str,
    max_attempts: u32,
    backoff: &BackoffPolicy,
) -> Result<FetchedDocument, FetchError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match fetch_once(client, url).await {
            Ok((status, body)) => {
                tracing::debug!(
                    "Fetched {} ({} bytes, attempt {}/{})",
                    url,
                    body.len(),
                    attempt,
                    max_attempts
                );
                return Ok(FetchedDocument {
                    url: url.to_string(),
                    status,
                    body,
                    attempts: attempt,
                });
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = backoff.delay_for(attempt);
                tracing::debug!(
                    "Attempt {}/{} for {} failed ({}), retrying in {:?}",
                    attempt,
                    max_attempts,
                    url,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_without_jitter() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10))
            .without_jitter();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_millis(1000), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(3000));
    }

    #[test]
    fn test_jittered_delays_are_bounded_and_non_decreasing() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(30);
        let policy = BackoffPolicy::new(base, max);

        for _ in 0..50 {
            let delays: Vec<Duration> = (1..=6).map(|n| policy.delay_for(n)).collect();
            for (i, delay) in delays.iter().enumerate() {
                let floor = base * 2u32.pow(i as u32);
                assert!(*delay >= floor);
                assert!(*delay <= floor + base / 4);
            }
            for pair in delays.windows(2) {
                assert!(pair[0] <= pair[1]);
            }
        }
    }

    #[test]
    fn test_max_below_base_is_raised() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_millis(100));
        assert_eq!(policy.max, Duration::from_millis(500));
    }

    #[test]
    fn test_client_builds_from_default_config() {
        assert!(build_http_client(&FetchConfig::default()).is_ok());
    }
}

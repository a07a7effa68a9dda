//! Reachability prober
//!
//! Measures TCP connect latency to `host:port`, caching DNS answers for the
//! lifetime of the prober and optionally tagging results with a country
//! code from a GeoIP database that is opened on first use.

mod geo;

pub use geo::{GeoLookup, MaxMindGeo, StaticGeo};

use crate::config::ProbeConfig;
use crate::protocol::NormalizedEndpoint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Outcome of a reachability probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReachabilityResult {
    pub reachable: bool,
    /// Connect handshake time; `None` when unreachable or not probed
    pub latency_ms: Option<f64>,
    pub country: Option<String>,
    /// `false` when probing was skipped for this endpoint
    #[serde(default)]
    pub probed: bool,
}

impl ReachabilityResult {
    pub fn reachable(latency_ms: f64, country: Option<String>) -> Self {
        Self {
            reachable: true,
            latency_ms: Some(latency_ms),
            country,
            probed: true,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            latency_ms: None,
            country: None,
            probed: true,
        }
    }

    /// Placeholder used when probing is disabled
    pub fn unprobed() -> Self {
        Self {
            reachable: false,
            latency_ms: None,
            country: None,
            probed: false,
        }
    }
}

enum GeoState {
    Pending,
    Ready(Arc<dyn GeoLookup>),
    Unavailable,
}

/// TCP reachability prober with DNS and GeoIP caching
pub struct Prober {
    timeout: Duration,
    geo_path: Option<PathBuf>,
    dns_cache: RwLock<HashMap<String, IpAddr>>,
    geo: Mutex<GeoState>,
    closed: AtomicBool,
}

impl Prober {
    /// Creates a prober from the probe configuration
    ///
    /// The GeoIP database is not touched until the first country lookup.
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            timeout: config.timeout(),
            geo_path: config.geoip_database.clone(),
            dns_cache: RwLock::new(HashMap::new()),
            geo: Mutex::new(GeoState::Pending),
            closed: AtomicBool::new(false),
        }
    }

    /// Uses `geo` instead of opening the configured database
    pub fn with_geo(self, geo: Arc<dyn GeoLookup>) -> Self {
        *self.geo.lock().unwrap_or_else(|e| e.into_inner()) = GeoState::Ready(geo);
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn geo_reader(&self) -> Option<Arc<dyn GeoLookup>> {
        let mut state = self.geo.lock().unwrap_or_else(|e| e.into_inner());

        if let GeoState::Pending = *state {
            *state = match (&self.geo_path, self.is_closed()) {
                (Some(path), false) => match MaxMindGeo::open(path) {
                    Ok(reader) => {
                        tracing::info!("Opened GeoIP database {}", path.display());
                        GeoState::Ready(Arc::new(reader))
                    }
                    Err(e) => {
                        tracing::warn!("GeoIP database {} unavailable: {}", path.display(), e);
                        GeoState::Unavailable
                    }
                },
                _ => GeoState::Unavailable,
            };
        }

        match &*state {
            GeoState::Ready(geo) => Some(Arc::clone(geo)),
            _ => None,
        }
    }

    /// Resolves `host` to one address, caching successful answers
    ///
    /// Resolution failures are soft: they return `None` and leave the cache
    /// untouched so a later call may retry.
    pub async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }

        if let Some(ip) = self
            .dns_cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(host)
        {
            return Some(*ip);
        }

        let ip = match tokio::net::lookup_host((host, 0)).await {
            Ok(mut addrs) => addrs.next().map(|addr| addr.ip()),
            Err(e) => {
                tracing::debug!("DNS resolution failed for {}: {}", host, e);
                None
            }
        }?;

        if !self.is_closed() {
            self.dns_cache
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(host.to_string(), ip);
        }

        Some(ip)
    }

    pub fn cached_address(&self, host: &str) -> Option<IpAddr> {
        self.dns_cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(host)
            .copied()
    }

    /// Measures TCP connect latency to `host:port`
    ///
    /// # Arguments
    ///
    /// * `host` - Hostname or IP literal
    /// * `port` - TCP port
    /// * `timeout` - Upper bound for resolution plus handshake
    ///
    /// # Returns
    ///
    /// A reachable result with latency, or `reachable = false` with no
    /// latency on timeout, resolution failure, or connection error.
    pub async fn probe(&self, host: &str, port: u16, timeout: Duration) -> ReachabilityResult {
        let started = Instant::now();

        let ip = match tokio::time::timeout(timeout, self.resolve(host)).await {
            Ok(Some(ip)) => ip,
            Ok(None) => return ReachabilityResult::unreachable(),
            Err(_) => {
                tracing::debug!("DNS resolution timed out for {}", host);
                return ReachabilityResult::unreachable();
            }
        };

        let remaining = timeout.saturating_sub(started.elapsed());
        let connect_started = Instant::now();

        match tokio::time::timeout(remaining, TcpStream::connect(SocketAddr::new(ip, port))).await {
            Ok(Ok(stream)) => {
                let latency_ms = connect_started.elapsed().as_secs_f64() * 1000.0;
                drop(stream);
                let country = self.geo_reader().and_then(|geo| geo.country(ip));
                ReachabilityResult::reachable(latency_ms, country)
            }
            Ok(Err(e)) => {
                tracing::debug!("Connect to {}:{} failed: {}", host, port, e);
                ReachabilityResult::unreachable()
            }
            Err(_) => {
                tracing::debug!("Connect to {}:{} timed out after {:?}", host, port, timeout);
                ReachabilityResult::unreachable()
            }
        }
    }

    /// Probes an endpoint with the configured timeout
    pub async fn probe_endpoint(&self, endpoint: &NormalizedEndpoint) -> ReachabilityResult {
        self.probe(&endpoint.host, endpoint.port, self.timeout).await
    }

    /// Looks up the country of `host`
    ///
    /// Returns `None` when no database is configured, it failed to open, or
    /// the host cannot be resolved.
    pub async fn lookup_country(&self, host: &str) -> Option<String> {
        let geo = self.geo_reader()?;
        let ip = self.resolve(host).await?;
        geo.country(ip)
    }

    /// Drops the DNS cache and the GeoIP reader
    ///
    /// Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dns_cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.geo.lock().unwrap_or_else(|e| e.into_inner()) = GeoState::Unavailable;
        tracing::debug!("Prober closed");
    }
}

/// Checks whether an endpoint answers
///
/// [`Prober`] is the production implementation; the coordinator only sees
/// this trait.
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    async fn check(&self, endpoint: &NormalizedEndpoint) -> ReachabilityResult;

    /// Releases held resources; must tolerate repeated calls
    fn close(&self) {}
}

#[async_trait]
impl ReachabilityCheck for Prober {
    async fn check(&self, endpoint: &NormalizedEndpoint) -> ReachabilityResult {
        self.probe_endpoint(endpoint).await
    }

    fn close(&self) {
        Prober::close(self);
    }
}

impl Drop for Prober {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn prober() -> Prober {
        Prober::new(&ProbeConfig::default())
    }

    #[tokio::test]
    async fn test_probe_reachable_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = prober()
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await;
        assert!(result.reachable);
        assert!(result.probed);
        assert!(result.latency_ms.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_probe_closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let started = Instant::now();
        let result = prober()
            .probe("127.0.0.1", port, Duration::from_secs(2))
            .await;
        assert!(!result.reachable);
        assert_eq!(result.latency_ms, None);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_probe_unresolvable_host() {
        let result = prober()
            .probe("does-not-exist.invalid", 443, Duration::from_secs(2))
            .await;
        assert!(!result.reachable);
        assert_eq!(result.latency_ms, None);
    }

    #[tokio::test]
    async fn test_dns_cache_population() {
        let prober = prober();
        assert_eq!(prober.resolve("127.0.0.1").await, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        // IP literals never enter the cache
        assert_eq!(prober.cached_address("127.0.0.1"), None);

        if let Some(ip) = prober.resolve("localhost").await {
            assert_eq!(prober.cached_address("localhost"), Some(ip));
        }

        assert_eq!(prober.resolve("does-not-exist.invalid").await, None);
        assert_eq!(prober.cached_address("does-not-exist.invalid"), None);
    }

    #[tokio::test]
    async fn test_country_lookup_without_database() {
        assert_eq!(prober().lookup_country("127.0.0.1").await, None);
    }

    #[tokio::test]
    async fn test_country_lookup_with_missing_database() {
        let config = ProbeConfig {
            geoip_database: Some(PathBuf::from("/nonexistent/GeoLite2-Country.mmdb")),
            ..ProbeConfig::default()
        };
        assert_eq!(Prober::new(&config).lookup_country("127.0.0.1").await, None);
    }

    #[tokio::test]
    async fn test_country_lookup_with_injected_geo() {
        let geo = StaticGeo::new().with(IpAddr::V4(Ipv4Addr::LOCALHOST), "ZZ");
        let prober = prober().with_geo(Arc::new(geo));
        assert_eq!(prober.lookup_country("127.0.0.1").await.as_deref(), Some("ZZ"));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let result = prober.probe("127.0.0.1", port, Duration::from_secs(2)).await;
        assert_eq!(result.country.as_deref(), Some("ZZ"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let geo = StaticGeo::new().with(IpAddr::V4(Ipv4Addr::LOCALHOST), "ZZ");
        let prober = prober().with_geo(Arc::new(geo));
        prober.close();
        prober.close();
        assert!(prober.is_closed());
        assert_eq!(prober.lookup_country("127.0.0.1").await, None);
    }

    #[test]
    fn test_result_serialization() {
        let result = ReachabilityResult::reachable(12.5, Some("DE".to_string()));
        let json = serde_json::to_string(&result).unwrap();
        let back: ReachabilityResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, back);
    }
}

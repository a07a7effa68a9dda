//! Integration tests for the aggregation pipeline
//!
//! These tests use wiremock to serve subscription documents and exercise
//! fetch, retry, decoding, dedup, probing, and ranking end-to-end.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use submerge::cache::TieredCache;
use submerge::config::{Config, SourceRef, SourceTier};
use submerge::fetcher::{build_http_client, fetch_source, BackoffPolicy};
use submerge::{Coordinator, NormalizedEndpoint, Protocol, ReachabilityCheck, ReachabilityResult};
use tokio::net::TcpListener;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a configuration with fast retries and probing off
fn create_test_config() -> Config {
    let mut config = Config::default();
    config.fetch.retry_attempts = 3;
    config.fetch.retry_base_delay_ms = 10;
    config.fetch.retry_max_delay_ms = 50;
    config.fetch.timeout_secs = 5;
    config.probe.enabled = false;
    config
}

fn source(server: &MockServer, route: &str) -> SourceRef {
    SourceRef::new(format!("{}{}", server.uri(), route), SourceTier::Default)
}

fn vmess(json: &str) -> String {
    format!("vmess://{}", STANDARD.encode(json))
}

async fn serve(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_transient_failure_is_attempted_exactly_retry_attempts_times() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let coordinator = Coordinator::new(create_test_config()).unwrap();
    let outcome = coordinator.run(&[source(&server, "/flaky")]).await;

    assert!(outcome.is_empty());
    assert_eq!(outcome.stats.sources_failed, 1);
    assert_eq!(outcome.failures.len(), 1);
    assert!(outcome.failures[0].error.contains("503"));
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let outcome = Coordinator::new(create_test_config())
        .unwrap()
        .run(&[source(&server, "/limited")])
        .await;
    assert_eq!(outcome.stats.sources_failed, 1);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = Coordinator::new(create_test_config())
        .unwrap()
        .run(&[source(&server, "/gone")])
        .await;
    assert_eq!(outcome.stats.sources_failed, 1);
    assert!(outcome.failures[0].error.contains("404"));
}

#[tokio::test]
async fn test_fetch_recovers_after_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/recovering"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    serve(&server, "/recovering", "trojan://pw@h.example:443".to_string()).await;

    let config = create_test_config();
    let client = build_http_client(&config.fetch).unwrap();
    let backoff = BackoffPolicy::from_config(&config.fetch);
    let url = format!("{}/recovering", server.uri());

    let document = fetch_source(&client, &url, 3, &backoff).await.unwrap();
    assert_eq!(document.attempts, 3);
    assert_eq!(document.body, "trojan://pw@h.example:443");
}

#[tokio::test]
async fn test_redirect_loop_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop"))
        .mount(&server)
        .await;

    let config = create_test_config();
    let client = build_http_client(&config.fetch).unwrap();
    let backoff = BackoffPolicy::from_config(&config.fetch);
    let url = format!("{}/loop", server.uri());

    let err = fetch_source(&client, &url, 3, &backoff).await.unwrap_err();
    assert!(!err.is_retryable());

    // One attempt: the first request plus at most ten redirect hops
    let requests = server.received_requests().await.unwrap();
    assert!(!requests.is_empty());
    assert!(requests.len() <= 11, "{} requests", requests.len());
}

#[tokio::test]
async fn test_gzip_body_is_decompressed() {
    let body = "trojan://pw@gz.example:443\nvless://id@gz2.example:443";
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gz"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Encoding", "gzip")
                .set_body_bytes(compressed),
        )
        .mount(&server)
        .await;

    let outcome = Coordinator::new(create_test_config())
        .unwrap()
        .run(&[source(&server, "/gz")])
        .await;

    assert_eq!(outcome.endpoints.len(), 2);
    assert_eq!(outcome.stats.lines_seen, 2);
}

#[tokio::test]
async fn test_base64_subscription_is_decoded() {
    let server = MockServer::start().await;
    let lines = [
        vmess(r#"{"add":"example.com","port":443,"id":"a1"}"#),
        "trojan://secret@host.example:8443#tag".to_string(),
        "vless://uuid@v.example:443?security=tls&type=ws".to_string(),
    ];
    serve(&server, "/sub", STANDARD.encode(lines.join("\n"))).await;

    let outcome = Coordinator::new(create_test_config())
        .unwrap()
        .run(&[source(&server, "/sub")])
        .await;

    assert_eq!(outcome.endpoints.len(), 3);
    assert_eq!(outcome.stats.sources_ok, 1);
    let hosts: Vec<&str> = outcome
        .endpoints
        .iter()
        .map(|e| e.endpoint.host.as_str())
        .collect();
    assert!(hosts.contains(&"example.com"));
    assert!(hosts.contains(&"host.example"));
    assert!(hosts.contains(&"v.example"));
}

#[tokio::test]
async fn test_duplicates_across_sources_are_dropped() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/a",
        "ss://BASE64A@host:8388?x=1&y=2#first\ntrojan://secret@host.example:8443#a".to_string(),
    )
    .await;
    serve(
        &server,
        "/b",
        "ss://BASE64A@host:8388?y=2&x=1#second\ntrojan://secret@HOST.example:8443#b\ntrojan://other@host.example:8443".to_string(),
    )
    .await;

    let outcome = Coordinator::new(create_test_config())
        .unwrap()
        .run(&[source(&server, "/a"), source(&server, "/b")])
        .await;

    assert_eq!(outcome.endpoints.len(), 3);
    assert_eq!(outcome.stats.duplicates, 2);

    let mut fingerprints: Vec<_> = outcome.endpoints.iter().map(|e| &e.fingerprint).collect();
    fingerprints.sort();
    fingerprints.dedup();
    assert_eq!(fingerprints.len(), 3);
}

#[tokio::test]
async fn test_failed_source_does_not_abort_batch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    serve(&server, "/ok", "trojan://pw@h.example:443".to_string()).await;

    let outcome = Coordinator::new(create_test_config())
        .unwrap()
        .run(&[source(&server, "/broken"), source(&server, "/ok")])
        .await;

    assert_eq!(outcome.endpoints.len(), 1);
    assert_eq!(outcome.stats.sources_ok, 1);
    assert_eq!(outcome.stats.sources_failed, 1);
    assert_eq!(outcome.failures[0].url, format!("{}/broken", server.uri()));
}

#[tokio::test]
async fn test_malformed_candidates_are_dropped() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/mixed",
        "vmess://%%%invalid%%%\nvless://no-port-here\nhello world, not a config\ntrojan://pw@h.example:443".to_string(),
    )
    .await;

    let outcome = Coordinator::new(create_test_config())
        .unwrap()
        .run(&[source(&server, "/mixed")])
        .await;

    assert_eq!(outcome.endpoints.len(), 1);
    assert_eq!(outcome.stats.invalid, 2);
    assert_eq!(outcome.stats.lines_rejected, 1);
    assert_eq!(outcome.stats.lines_seen, 4);
}

#[tokio::test]
async fn test_protocol_filter_and_result_limit() {
    let server = MockServer::start().await;
    let body = [
        "trojan://a@t1.example:443",
        "trojan://b@t2.example:443",
        "trojan://c@t3.example:443",
        "socks5://s.example:1080",
    ]
    .join("\n");
    serve(&server, "/sub", body).await;

    let mut config = create_test_config();
    config.output.exclude_protocols = vec!["socks".to_string()];
    config.output.max_results = 2;

    let outcome = Coordinator::new(config)
        .unwrap()
        .run(&[source(&server, "/sub")])
        .await;

    assert_eq!(outcome.endpoints.len(), 2);
    assert_eq!(outcome.stats.filtered, 1);
    assert!(outcome
        .endpoints
        .iter()
        .all(|e| e.endpoint.protocol == Protocol::Trojan));
}

#[tokio::test]
async fn test_probing_ranks_reachable_first_and_uses_cache() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let closed = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    let server = MockServer::start().await;
    serve(
        &server,
        "/sub",
        format!(
            "trojan://pw@127.0.0.1:{}\ntrojan://pw@127.0.0.1:{}",
            closed, open
        ),
    )
    .await;

    let mut config = create_test_config();
    config.probe.enabled = true;
    config.probe.timeout_ms = 1000;
    let cache = Arc::new(TieredCache::new(&config.cache));
    let coordinator = Coordinator::new(config)
        .unwrap()
        .with_cache(Arc::clone(&cache));
    let sources = [source(&server, "/sub")];

    let outcome = coordinator.run(&sources).await;
    assert_eq!(outcome.endpoints.len(), 2);
    assert_eq!(outcome.stats.probed, 2);
    assert_eq!(outcome.stats.reachable, 1);

    let best = &outcome.endpoints[0];
    assert_eq!(best.endpoint.port, open);
    assert!(best.reachability.reachable);
    assert!(best.reachability.latency_ms.is_some());

    let worst = &outcome.endpoints[1];
    assert!(!worst.reachability.reachable);
    assert_eq!(worst.reachability.latency_ms, None);
    assert!(best.score > worst.score);

    // Second run answers every probe from the cache
    let again = coordinator.run(&sources).await;
    assert_eq!(again.endpoints.len(), 2);
    assert_eq!(again.stats.cache_hits, 2);
    assert_eq!(again.stats.probed, 0);
}

#[tokio::test]
async fn test_cancellation_keeps_partial_results() {
    let server = MockServer::start().await;
    serve(&server, "/fast", "trojan://pw@fast.example:443".to_string()).await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("trojan://pw@slow.example:443")
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let mut config = create_test_config();
    config.fetch.timeout_secs = 60;
    let coordinator = Coordinator::new(config).unwrap();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = cancel_tx.send(true);
    });

    let started = std::time::Instant::now();
    let outcome = coordinator
        .run_until(&[source(&server, "/fast"), source(&server, "/slow")], cancel_rx)
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(outcome.stats.cancelled);
    assert_eq!(outcome.endpoints.len(), 1);
    assert_eq!(outcome.endpoints[0].endpoint.host, "fast.example");
}

/// Reachability check that records how many calls overlap
#[derive(Default)]
struct CountingCheck {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl ReachabilityCheck for CountingCheck {
    async fn check(&self, _endpoint: &NormalizedEndpoint) -> ReachabilityResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(50)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        ReachabilityResult::reachable(5.0, None)
    }
}

#[tokio::test]
async fn test_reachability_checks_respect_concurrency_bound() {
    let server = MockServer::start().await;
    let body: Vec<String> = (0..8)
        .map(|i| format!("trojan://pw{}@h{}.example:443", i, i))
        .collect();
    serve(&server, "/sub", body.join("\n")).await;

    let mut config = create_test_config();
    config.probe.enabled = true;
    config.probe.concurrency = 2;

    let check = Arc::new(CountingCheck::default());
    let coordinator = Coordinator::new(config)
        .unwrap()
        .with_prober(Some(check.clone() as Arc<dyn ReachabilityCheck>));

    let outcome = coordinator.run(&[source(&server, "/sub")]).await;

    assert_eq!(outcome.endpoints.len(), 8);
    assert_eq!(outcome.stats.probed, 8);
    assert_eq!(check.calls.load(Ordering::SeqCst), 8);
    assert_eq!(check.peak.load(Ordering::SeqCst), 2);
}

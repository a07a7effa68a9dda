//! Pipeline coordinator - fetches sources and drives every candidate through
//! normalize → dedup → probe → score
//!
//! Sources run concurrently under a semaphore. Within a source, candidates
//! are normalized and claimed in line order; claimed endpoints are then
//! probed and scored concurrently, with a run-wide bound on open probes.
//! Scored endpoints are accumulated as they complete so that a cancelled
//! run still returns everything finished so far.

use crate::cache::TieredCache;
use crate::config::{Config, OutputConfig, SourceRef};
use crate::dedup::{fingerprint, Deduplicator, SemanticFingerprint};
use crate::fetcher::{
    build_http_client, decode_payload, extract_candidates, fetch_source, BackoffPolicy,
};
use crate::probe::{Prober, ReachabilityCheck, ReachabilityResult};
use crate::protocol::{HandlerRegistry, NormalizedEndpoint, Protocol};
use crate::scoring::{HeuristicScorer, Scorer};
use crate::MergeError;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Tag attached to cached probe results
pub const PROBE_CACHE_TAG: &str = "probe";

/// Claimed endpoints of one source scored concurrently
const SCORING_FANOUT: usize = 32;

/// Final ranked record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredEndpoint {
    pub endpoint: NormalizedEndpoint,
    pub fingerprint: SemanticFingerprint,
    pub reachability: ReachabilityResult,
    pub score: f64,
    /// URL of the source that contributed this endpoint first
    pub source: String,
}

/// A source abandoned after its retries ran out
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub url: String,
    pub error: String,
}

/// Counters for one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub lines_seen: usize,
    pub lines_rejected: usize,
    pub invalid: usize,
    pub filtered: usize,
    pub duplicates: usize,
    pub probed: usize,
    pub reachable: usize,
    pub cache_hits: usize,
    pub cancelled: bool,
}

/// Everything a run produced
#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    /// Ranked endpoints, best first
    pub endpoints: Vec<ScoredEndpoint>,
    pub stats: RunStats,
    pub failures: Vec<SourceFailure>,
}

impl PipelineOutcome {
    /// True when no endpoint survived the run
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[derive(Debug, Default)]
struct Counters {
    sources_ok: AtomicUsize,
    sources_failed: AtomicUsize,
    lines_seen: AtomicUsize,
    lines_rejected: AtomicUsize,
    invalid: AtomicUsize,
    filtered: AtomicUsize,
    duplicates: AtomicUsize,
    probed: AtomicUsize,
    reachable: AtomicUsize,
    cache_hits: AtomicUsize,
}

impl Counters {
    fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self, cancelled: bool) -> RunStats {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        RunStats {
            sources_ok: load(&self.sources_ok),
            sources_failed: load(&self.sources_failed),
            lines_seen: load(&self.lines_seen),
            lines_rejected: load(&self.lines_rejected),
            invalid: load(&self.invalid),
            filtered: load(&self.filtered),
            duplicates: load(&self.duplicates),
            probed: load(&self.probed),
            reachable: load(&self.reachable),
            cache_hits: load(&self.cache_hits),
            cancelled,
        }
    }
}

/// State shared by the tasks of one run
#[derive(Default)]
struct RunState {
    dedup: Deduplicator,
    counters: Counters,
    results: Mutex<Vec<ScoredEndpoint>>,
    failures: Mutex<Vec<SourceFailure>>,
}

impl RunState {
    fn push_result(&self, scored: ScoredEndpoint) {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(scored);
    }

    fn push_failure(&self, failure: SourceFailure) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(failure);
    }

    fn take_results(&self) -> Vec<ScoredEndpoint> {
        std::mem::take(&mut *self.results.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn take_failures(&self) -> Vec<SourceFailure> {
        std::mem::take(&mut *self.failures.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Include/exclude filter over protocol families
#[derive(Debug, Clone, Default)]
pub struct ProtocolFilter {
    include: HashSet<Protocol>,
    exclude: HashSet<Protocol>,
}

impl ProtocolFilter {
    /// Builds the filter from output configuration; unknown tags are ignored
    pub fn from_config(config: &OutputConfig) -> Self {
        let parse = |tags: &[String]| -> HashSet<Protocol> {
            tags.iter().filter_map(|t| Protocol::from_tag(t)).collect()
        };
        Self {
            include: parse(&config.include_protocols),
            exclude: parse(&config.exclude_protocols),
        }
    }

    pub fn allows(&self, protocol: Protocol) -> bool {
        (self.include.is_empty() || self.include.contains(&protocol))
            && !self.exclude.contains(&protocol)
    }
}

/// Orders endpoints best first
///
/// Score descending, then latency ascending with unknown latency last, then
/// fingerprint so the order is total.
pub fn rank(endpoints: &mut [ScoredEndpoint]) {
    endpoints.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| {
                match (a.reachability.latency_ms, b.reachability.latency_ms) {
                    (Some(x), Some(y)) => x.total_cmp(&y),
                    (Some(_), None) => CmpOrdering::Less,
                    (None, Some(_)) => CmpOrdering::Greater,
                    (None, None) => CmpOrdering::Equal,
                }
            })
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
}

/// Main pipeline coordinator
///
/// Cheap to clone; clones share the client, prober, scorer, and cache.
#[derive(Clone)]
pub struct Coordinator {
    config: Arc<Config>,
    client: Client,
    registry: Arc<HandlerRegistry>,
    prober: Option<Arc<dyn ReachabilityCheck>>,
    scorer: Arc<dyn Scorer>,
    cache: Option<Arc<TieredCache>>,
    filter: Arc<ProtocolFilter>,
    backoff: BackoffPolicy,
}

impl Coordinator {
    /// Creates a coordinator with the heuristic scorer and no cache
    ///
    /// # Arguments
    ///
    /// * `config` - The validated configuration
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Ready to run
    /// * `Err(MergeError)` - The HTTP client could not be built
    pub fn new(config: Config) -> Result<Self, MergeError> {
        let client = build_http_client(&config.fetch)?;
        let prober = config
            .probe
            .enabled
            .then(|| Arc::new(Prober::new(&config.probe)) as Arc<dyn ReachabilityCheck>);

        Ok(Self {
            client,
            registry: Arc::new(HandlerRegistry::default()),
            prober,
            scorer: Arc::new(HeuristicScorer::new()),
            cache: None,
            filter: Arc::new(ProtocolFilter::from_config(&config.output)),
            backoff: BackoffPolicy::from_config(&config.fetch),
            config: Arc::new(config),
        })
    }

    /// Replaces the scorer, e.g. with a model-backed one
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Caches probe results in `cache`
    pub fn with_cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replaces the prober; `None` disables probing
    pub fn with_prober(mut self, prober: Option<Arc<dyn ReachabilityCheck>>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the pipeline with the configured source concurrency
    pub async fn run(&self, sources: &[SourceRef]) -> PipelineOutcome {
        self.fetch_and_process(sources, self.config.fetch.concurrency)
            .await
    }

    /// Runs the pipeline over `sources` with at most `concurrency` fetches in flight
    pub async fn fetch_and_process(&self, sources: &[SourceRef], concurrency: usize) -> PipelineOutcome {
        let (_keep_open, cancel) = watch::channel(false);
        self.execute(sources, concurrency, cancel).await
    }

    /// Runs the pipeline until it finishes or `cancel` turns `true`
    ///
    /// On cancellation every in-flight task is aborted and the endpoints
    /// scored so far are ranked and returned.
    pub async fn run_until(
        &self,
        sources: &[SourceRef],
        cancel: watch::Receiver<bool>,
    ) -> PipelineOutcome {
        self.execute(sources, self.config.fetch.concurrency, cancel)
            .await
    }

    /// Releases prober resources; the coordinator must not be run afterwards
    pub fn close(&self) {
        if let Some(prober) = &self.prober {
            prober.close();
        }
    }

    async fn execute(
        &self,
        sources: &[SourceRef],
        concurrency: usize,
        mut cancel: watch::Receiver<bool>,
    ) -> PipelineOutcome {
        let state = Arc::new(RunState::default());

        if *cancel.borrow() {
            tracing::info!("Run cancelled before start");
            return self.finish(&state, true);
        }

        let concurrency = concurrency.max(1);
        tracing::info!(
            "Processing {} sources with concurrency {}",
            sources.len(),
            concurrency
        );

        let fetch_slots = Arc::new(Semaphore::new(concurrency));
        let probe_slots = Arc::new(Semaphore::new(self.config.probe.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for source in sources.iter().cloned() {
            let this = self.clone();
            let state = Arc::clone(&state);
            let fetch_slots = Arc::clone(&fetch_slots);
            let probe_slots = Arc::clone(&probe_slots);

            tasks.spawn(async move {
                let Ok(_permit) = fetch_slots.acquire_owned().await else {
                    return;
                };
                this.process_source(source, &state, &probe_slots).await;
            });
        }

        let mut listening = true;
        let cancelled = loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break false,
                    Some(Err(e)) if e.is_panic() => tracing::error!("Source task panicked: {}", e),
                    Some(_) => {}
                },
                changed = cancel.changed(), if listening => match changed {
                    Ok(()) if *cancel.borrow() => break true,
                    Ok(()) => {}
                    Err(_) => listening = false,
                },
            }
        };

        if cancelled {
            tracing::info!("Cancellation requested, stopping {} tasks", tasks.len());
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.finish(&state, cancelled)
    }

    fn finish(&self, state: &RunState, cancelled: bool) -> PipelineOutcome {
        let mut endpoints = state.take_results();
        rank(&mut endpoints);

        let output = &self.config.output;
        endpoints.retain(|e| e.score >= output.min_score);
        if output.max_results > 0 {
            endpoints.truncate(output.max_results);
        }

        let stats = state.counters.snapshot(cancelled);
        tracing::info!(
            "Run finished: {} endpoints from {} sources ({} failed), {} duplicates, {} invalid",
            endpoints.len(),
            stats.sources_ok,
            stats.sources_failed,
            stats.duplicates,
            stats.invalid
        );

        PipelineOutcome {
            endpoints,
            stats,
            failures: state.take_failures(),
        }
    }

    async fn process_source(&self, source: SourceRef, state: &RunState, probe_slots: &Semaphore) {
        let fetch = &self.config.fetch;
        let document = match fetch_source(&self.client, &source.url, fetch.retry_attempts, &self.backoff).await {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!("Abandoning source {}: {}", source.url, e);
                Counters::add(&state.counters.sources_failed, 1);
                state.push_failure(SourceFailure {
                    url: source.url.clone(),
                    error: e.to_string(),
                });
                return;
            }
        };
        Counters::add(&state.counters.sources_ok, 1);

        let text = decode_payload(&document.body);
        let extracted = extract_candidates(&text, &source.url, fetch);
        Counters::add(&state.counters.lines_seen, extracted.seen);
        Counters::add(&state.counters.lines_rejected, extracted.rejected);

        let mut claimed = Vec::new();
        for candidate in extracted.candidates {
            let endpoint = match self.registry.normalize(&candidate.text) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::debug!("Dropping candidate from {}: {}", source.url, e);
                    Counters::add(&state.counters.invalid, 1);
                    continue;
                }
            };

            if !self.filter.allows(endpoint.protocol) {
                Counters::add(&state.counters.filtered, 1);
                continue;
            }

            let fp = fingerprint(&endpoint);
            if !state.dedup.try_claim(&fp) {
                Counters::add(&state.counters.duplicates, 1);
                continue;
            }
            claimed.push((endpoint, fp));
        }

        tracing::debug!(
            "Source {} yielded {} new endpoints after {} attempt(s)",
            source.url,
            claimed.len(),
            document.attempts
        );

        let reliability = source.reliability();
        let source_url = source.url.as_str();
        stream::iter(claimed)
            .map(|(endpoint, fp)| async move {
                let reachability = self.reachability(&endpoint, state, probe_slots).await;
                let score = self.scorer.score(&endpoint, &reachability, reliability);
                ScoredEndpoint {
                    endpoint,
                    fingerprint: fp,
                    reachability,
                    score,
                    source: source_url.to_string(),
                }
            })
            .buffer_unordered(SCORING_FANOUT)
            .for_each(|scored| {
                state.push_result(scored);
                futures::future::ready(())
            })
            .await;
    }

    /// Probes an endpoint, consulting and filling the cache
    async fn reachability(
        &self,
        endpoint: &NormalizedEndpoint,
        state: &RunState,
        probe_slots: &Semaphore,
    ) -> ReachabilityResult {
        let Some(prober) = &self.prober else {
            return ReachabilityResult::unprobed();
        };

        let key = format!("{}:{}:{}", PROBE_CACHE_TAG, endpoint.host, endpoint.port);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get_json::<ReachabilityResult>(&key).await {
                Counters::add(&state.counters.cache_hits, 1);
                return hit;
            }
        }

        let result = match probe_slots.acquire().await {
            Ok(_permit) => prober.check(endpoint).await,
            Err(_) => return ReachabilityResult::unprobed(),
        };

        Counters::add(&state.counters.probed, 1);
        if result.reachable {
            Counters::add(&state.counters.reachable, 1);
        }

        if let Some(cache) = &self.cache {
            cache
                .set_json(
                    &key,
                    &result,
                    Some(self.config.cache.probe_ttl()),
                    &[PROBE_CACHE_TAG.to_string()],
                )
                .await;
        }

        result
    }
}

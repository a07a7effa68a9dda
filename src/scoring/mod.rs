//! Quality scoring
//!
//! Turns protocol posture, probe results, and source trust into a rank in
//! `[0, 100]`. The heuristic scorer is always available; an external
//! quality model can be plugged in through [`ModelScorer`], which falls back
//! to the heuristic whenever the model has no answer.

use crate::probe::ReachabilityResult;
use crate::protocol::{NormalizedEndpoint, Protocol};
use serde::Serialize;
use std::sync::Arc;

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 100.0;

const BASE_SCORE: f64 = 50.0;
const RELIABILITY_WEIGHT: f64 = 20.0;

const TLS_BONUS: f64 = 10.0;
const REALITY_BONUS: f64 = 15.0;
const TRANSPORT_BONUS: f64 = 5.0;

/// Ports that are commonly inspected or throttled
const COMMON_PORTS: &[u16] = &[80, 443, 8080, 8443];
const COMMON_PORT_PENALTY: f64 = 5.0;

/// Well-known service ports that rarely carry proxy traffic cleanly
const SERVICE_PORTS: &[u16] = &[21, 22, 23, 53];
const SERVICE_PORT_PENALTY: f64 = 15.0;

const UNREACHABLE_PENALTY: f64 = 20.0;

/// Ranks an endpoint
pub trait Scorer: Send + Sync {
    /// Returns a score clamped to `[0, 100]`
    fn score(
        &self,
        endpoint: &NormalizedEndpoint,
        reachability: &ReachabilityResult,
        source_reliability: f64,
    ) -> f64;
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return MIN_SCORE;
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Bonus for the protocol family's security posture
pub fn protocol_bonus(protocol: Protocol) -> f64 {
    match protocol {
        Protocol::Reality | Protocol::Vless => 20.0,
        Protocol::Vmess | Protocol::Trojan => 15.0,
        Protocol::Hysteria | Protocol::Hysteria2 | Protocol::Tuic | Protocol::ShadowTls => 12.0,
        Protocol::WireGuard => 10.0,
        Protocol::Shadowsocks => 8.0,
        Protocol::ShadowsocksR => 5.0,
        _ => 0.0,
    }
}

pub fn port_penalty(port: u16) -> f64 {
    if SERVICE_PORTS.contains(&port) {
        SERVICE_PORT_PENALTY
    } else if COMMON_PORTS.contains(&port) {
        COMMON_PORT_PENALTY
    } else {
        0.0
    }
}

/// Score adjustment from a probe
///
/// Non-increasing in latency. Skipped probes contribute nothing.
pub fn latency_adjustment(reachability: &ReachabilityResult) -> f64 {
    if !reachability.probed {
        return 0.0;
    }
    match (reachability.reachable, reachability.latency_ms) {
        (true, Some(ms)) if ms < 100.0 => 10.0,
        (true, Some(ms)) if ms < 300.0 => 5.0,
        (true, Some(ms)) if ms < 1000.0 => 0.0,
        (true, Some(_)) => -5.0,
        (true, None) => 0.0,
        (false, _) => -UNREACHABLE_PENALTY,
    }
}

/// Default rule-based scorer
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicScorer;

impl HeuristicScorer {
    pub fn new() -> Self {
        Self
    }
}

impl Scorer for HeuristicScorer {
    fn score(
        &self,
        endpoint: &NormalizedEndpoint,
        reachability: &ReachabilityResult,
        source_reliability: f64,
    ) -> f64 {
        let mut score = BASE_SCORE + protocol_bonus(endpoint.protocol);

        if endpoint.security.tls {
            score += TLS_BONUS;
        }
        if endpoint.security.reality {
            score += REALITY_BONUS;
        }
        if endpoint.security.ws || endpoint.security.grpc {
            score += TRANSPORT_BONUS;
        }

        score -= port_penalty(endpoint.port);
        score += latency_adjustment(reachability);
        score += source_reliability.clamp(0.0, 1.0) * RELIABILITY_WEIGHT;

        clamp_score(score)
    }
}

/// Attributes handed to an external quality model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointFeatures {
    pub protocol: Protocol,
    pub port: u16,
    pub tls: bool,
    pub reality: bool,
    pub ws: bool,
    pub grpc: bool,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    pub country: Option<String>,
    pub source_reliability: f64,
}

impl EndpointFeatures {
    pub fn extract(
        endpoint: &NormalizedEndpoint,
        reachability: &ReachabilityResult,
        source_reliability: f64,
    ) -> Self {
        Self {
            protocol: endpoint.protocol,
            port: endpoint.port,
            tls: endpoint.security.tls,
            reality: endpoint.security.reality,
            ws: endpoint.security.ws,
            grpc: endpoint.security.grpc,
            reachable: reachability.reachable,
            latency_ms: reachability.latency_ms,
            country: reachability.country.clone(),
            source_reliability,
        }
    }
}

/// An external predictor of endpoint quality
pub trait QualityModel: Send + Sync {
    /// Returns `None` when the model cannot score these features
    fn predict(&self, features: &EndpointFeatures) -> Option<f64>;
}

/// Scores with an external model, falling back to the heuristic
pub struct ModelScorer {
    model: Arc<dyn QualityModel>,
    fallback: HeuristicScorer,
}

impl ModelScorer {
    pub fn new(model: Arc<dyn QualityModel>) -> Self {
        Self {
            model,
            fallback: HeuristicScorer,
        }
    }
}

impl Scorer for ModelScorer {
    fn score(
        &self,
        endpoint: &NormalizedEndpoint,
        reachability: &ReachabilityResult,
        source_reliability: f64,
    ) -> f64 {
        let features = EndpointFeatures::extract(endpoint, reachability, source_reliability);
        match self.model.predict(&features) {
            Some(prediction) if prediction.is_finite() => clamp_score(prediction),
            _ => {
                tracing::debug!("Model gave no score for {}, using heuristic", endpoint.address());
                self.fallback.score(endpoint, reachability, source_reliability)
            }
        }
    }
}

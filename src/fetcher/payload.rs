//! Payload decoding and candidate extraction

use crate::config::FetchConfig;
use crate::protocol::{count_scheme_occurrences, decode_base64_text, has_known_prefix};
use std::borrow::Cow;

/// One line pulled from a source document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCandidate {
    pub text: String,
    pub source: String,
}

/// Candidates kept from one document and what was thrown away
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedLines {
    pub candidates: Vec<RawCandidate>,
    /// Non-empty lines considered, after the per-source cap
    pub seen: usize,
    /// Considered lines dropped by the length window or prefix check
    pub rejected: usize,
}

/// Unwraps a base64-encoded subscription
///
/// A payload is treated as encoded only when it is a single line, decodes
/// to UTF-8, and the decoded text holds more descriptor schemes than the
/// raw text. Plain payloads that happen to be valid base64 stay untouched
/// unless decoding reveals more schemes.
pub fn maybe_decode_subscription(payload: &str) -> Option<String> {
    let trimmed = payload.trim();
    if trimmed.is_empty() || trimmed.contains(['\n', '\r']) {
        return None;
    }

    let decoded = decode_base64_text(trimmed)?;
    (count_scheme_occurrences(&decoded) > count_scheme_occurrences(trimmed)).then_some(decoded)
}

/// Returns the effective subscription text of a fetched body
pub fn decode_payload(body: &str) -> Cow<'_, str> {
    match maybe_decode_subscription(body) {
        Some(decoded) => Cow::Owned(decoded),
        None => Cow::Borrowed(body),
    }
}

/// Splits a document into descriptor candidates
///
/// Lines are trimmed and blank ones skipped. At most
/// `max_lines_per_source` lines are considered; of those, lines outside the
/// length window or without a known scheme prefix are rejected. Order is
/// preserved.
pub fn extract_candidates(text: &str, source: &str, config: &FetchConfig) -> ExtractedLines {
    let mut extracted = ExtractedLines::default();

    for line in text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(config.max_lines_per_source)
    {
        extracted.seen += 1;

        let length = line.len();
        if length < config.min_line_length || length > config.max_line_length || !has_known_prefix(line)
        {
            extracted.rejected += 1;
            continue;
        }

        extracted.candidates.push(RawCandidate {
            text: line.to_string(),
            source: source.to_string(),
        });
    }

    extracted
}

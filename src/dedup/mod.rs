//! Semantic deduplication
//!
//! Two descriptors are duplicates when they point at the same account on
//! the same server, regardless of remarks, parameter order, or encoding.
//! The identity key is `identity@host:port`, hashed with SHA-256 and
//! truncated to 16 hex characters.

use crate::protocol::NormalizedEndpoint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

/// Length of a fingerprint in hex characters
pub const FINGERPRINT_LEN: usize = 16;

/// Content-addressed endpoint identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SemanticFingerprint(String);

impl SemanticFingerprint {
    /// Hashes an arbitrary identity key
    pub fn from_key(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_LEN);
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SemanticFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds the identity key hashed by [`fingerprint`]
///
/// Falls back to the canonical string when the endpoint carries no host.
pub fn identity_key(endpoint: &NormalizedEndpoint) -> String {
    if endpoint.host.is_empty() || endpoint.port == 0 {
        return endpoint.canonical.clone();
    }

    format!(
        "{}@{}:{}",
        endpoint.identity.as_deref().unwrap_or_default(),
        endpoint.host,
        endpoint.port
    )
}

/// Computes the semantic fingerprint of an endpoint
pub fn fingerprint(endpoint: &NormalizedEndpoint) -> SemanticFingerprint {
    SemanticFingerprint::from_key(&identity_key(endpoint))
}

/// First-writer-wins claim set shared by all pipeline tasks
#[derive(Debug, Default)]
pub struct Deduplicator {
    claimed: Mutex<HashSet<SemanticFingerprint>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a fingerprint
    ///
    /// # Returns
    ///
    /// * `true` - The fingerprint was not seen before and now belongs to the caller
    /// * `false` - Another candidate already claimed it
    pub fn try_claim(&self, fingerprint: &SemanticFingerprint) -> bool {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        if claimed.contains(fingerprint) {
            return false;
        }
        claimed.insert(fingerprint.clone())
    }

    pub fn contains(&self, fingerprint: &SemanticFingerprint) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every claim, for reuse across runs
    pub fn reset(&self) {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

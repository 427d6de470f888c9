//! Artifact map entries.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Expiring;

/// Random bytes behind an artifact handle.
const ARTIFACT_BYTES: usize = 20;

/// Generate a fresh artifact handle (20 random bytes, base64url).
pub fn generate_artifact() -> String {
    let bytes: [u8; ARTIFACT_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Protocol message parked behind a one-time artifact handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMapEntry {
    /// The handle handed to the browser.
    pub artifact: String,

    /// Party that issued the message.
    pub issuer: String,

    /// Party allowed to redeem the artifact.
    pub relying_party: String,

    /// The artifact can no longer be redeemed from this instant on.
    pub expire_at: DateTime<Utc>,

    /// Encoded protocol message; opaque to the store.
    pub payload: Vec<u8>,
}

impl ArtifactMapEntry {
    pub fn new(
        artifact: String,
        issuer: impl Into<String>,
        relying_party: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            artifact,
            issuer: issuer.into(),
            relying_party: relying_party.into(),
            expire_at: Utc::now(),
            payload,
        }
    }
}

impl Expiring for ArtifactMapEntry {
    fn expire_at(&self) -> DateTime<Utc> {
        self.expire_at
    }

    fn set_expire_at(&mut self, at: DateTime<Utc>) {
        self.expire_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_handles_are_unique_and_url_safe() {
        let a = generate_artifact();
        let b = generate_artifact();
        assert_ne!(a, b);
        assert_eq!(a.len(), 27);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}

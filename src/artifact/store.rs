//! Artifact store: short-lived, single-use handles for protocol messages.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::types::{generate_artifact, ArtifactMapEntry};
use crate::store::{ExpiringStore, Reclaim};

/// Attempts at drawing an unused artifact handle before giving up.
const MAX_ARTIFACT_ATTEMPTS: usize = 8;

/// One-time artifact store.
pub struct ArtifactStore {
    backend: Arc<dyn ExpiringStore<ArtifactMapEntry>>,
    ttl: Duration,
}

impl ArtifactStore {
    pub fn new(backend: Arc<dyn ExpiringStore<ArtifactMapEntry>>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Park `payload` behind a fresh artifact handle and return the entry.
    pub async fn issue(
        &self,
        issuer: &str,
        relying_party: &str,
        payload: Vec<u8>,
    ) -> Result<ArtifactMapEntry> {
        let mut artifact = generate_artifact();
        let mut attempts = 0;
        while self.backend.contains(&artifact).await? {
            attempts += 1;
            if attempts >= MAX_ARTIFACT_ATTEMPTS {
                return Err(anyhow!("Could not generate an unused artifact handle"));
            }
            artifact = generate_artifact();
        }

        let entry = ArtifactMapEntry::new(artifact, issuer, relying_party, payload);
        self.insert_new(entry).await
    }

    /// Store a freshly issued entry, stamping it with the store TTL.
    ///
    /// Handles only come from [`ArtifactStore::issue`]; a handle that is still
    /// live is never rebound to another payload.
    async fn insert_new(&self, entry: ArtifactMapEntry) -> Result<ArtifactMapEntry> {
        let key = entry.artifact.clone();
        if self.backend.contains(&key).await? {
            bail!("Artifact handle is already in use");
        }
        self.backend.put_with_ttl(&key, entry, self.ttl).await?;

        let stored = self
            .backend
            .get(&key)
            .await?
            .ok_or_else(|| anyhow!("Artifact vanished right after issuance"))?;

        debug!(
            issuer = %stored.issuer,
            relying_party = %stored.relying_party,
            expire_at = %stored.expire_at,
            "Artifact issued"
        );
        Ok(stored)
    }

    /// Look an artifact up without consuming it.
    pub async fn get(&self, artifact: &str) -> Result<Option<ArtifactMapEntry>> {
        self.backend.get(artifact).await
    }

    pub async fn contains(&self, artifact: &str) -> Result<bool> {
        self.backend.contains(artifact).await
    }

    pub async fn remove(&self, artifact: &str) -> Result<bool> {
        self.backend.remove(artifact).await
    }

    /// Resolve an artifact exactly once: fetch it, then remove it.
    ///
    /// Only the caller whose remove succeeds gets the payload. On a replicated
    /// backend that remove reports whether the entry was present in this
    /// node's copy, so two nodes redeeming the same handle before either
    /// removal has reached the other can both succeed. Sequential
    /// redemptions, on any nodes, yield the payload once.
    pub async fn redeem(&self, artifact: &str) -> Result<Option<ArtifactMapEntry>> {
        let Some(entry) = self.backend.get(artifact).await? else {
            debug!("Artifact unknown, expired or already redeemed");
            return Ok(None);
        };

        if !self.backend.remove(artifact).await? {
            debug!("Artifact redeemed concurrently");
            return Ok(None);
        }

        debug!(relying_party = %entry.relying_party, "Artifact redeemed");
        Ok(Some(entry))
    }

    pub async fn count(&self) -> Result<usize> {
        self.backend.len().await
    }
}

#[async_trait]
impl Reclaim for ArtifactStore {
    fn name(&self) -> &str {
        "artifact"
    }

    async fn reclaim(&self) -> Result<usize> {
        self.backend.reclaim().await
    }
}

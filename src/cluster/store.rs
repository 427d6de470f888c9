//! Expiring store on top of a replicated map.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use super::channel::ReplicationChannel;
use crate::store::{ExpiringStore, StoreValue};

/// Expiring store whose entries are shared by every node of a cluster.
///
/// Values travel as MessagePack. Any node may reclaim an expired entry; the
/// removal is replicated so the others drop it too.
pub struct ReplicatedStore<V> {
    channel: Arc<ReplicationChannel>,
    _value: PhantomData<fn() -> V>,
}

impl<V: StoreValue> ReplicatedStore<V> {
    pub fn new(channel: Arc<ReplicationChannel>) -> Self {
        Self {
            channel,
            _value: PhantomData,
        }
    }

    pub fn channel(&self) -> &Arc<ReplicationChannel> {
        &self.channel
    }

    fn decode(bytes: &[u8]) -> Result<V> {
        rmp_serde::from_slice(bytes).context("Failed to deserialize replicated entry")
    }

    fn read(&self, key: &str) -> Result<Option<V>> {
        match self.channel.get(key)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<V: StoreValue> ExpiringStore<V> for ReplicatedStore<V> {
    async fn put(&self, key: &str, value: V) -> Result<()> {
        let data =
            rmp_serde::to_vec_named(&value).context("Failed to serialize replicated entry")?;
        self.channel.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.read(key)?.filter(|v| !v.is_expired()))
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.read(key)?.is_some_and(|v| !v.is_expired()))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.channel.remove(key).await
    }

    async fn reclaim(&self) -> Result<usize> {
        let mut expired = Vec::new();
        for (key, bytes) in self.channel.snapshot()? {
            match Self::decode(&bytes) {
                Ok(v) if v.is_expired() => expired.push(key),
                Err(e) => {
                    warn!(
                        cluster = %self.channel.cluster_id(),
                        key = %key,
                        error = %e,
                        "Undecodable replicated entry, marking for deletion"
                    );
                    expired.push(key);
                }
                _ => {}
            }
        }

        let mut reclaimed = 0;
        for key in expired {
            // Re-check: another node may have refreshed the entry meanwhile.
            let still_expired = match self.channel.get(&key)? {
                Some(bytes) => Self::decode(&bytes).map(|v| v.is_expired()).unwrap_or(true),
                None => false,
            };
            if still_expired && self.channel.remove(&key).await? {
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            debug!(cluster = %self.channel.cluster_id(), reclaimed, "Reclaimed expired replicated entries");
        }
        Ok(reclaimed)
    }

    async fn len(&self) -> Result<usize> {
        self.channel.size()
    }
}

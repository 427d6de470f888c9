//! In-memory expiring store.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

use super::{ExpiringStore, StoreValue};

/// Expiring store kept in a process-local map.
///
/// Reads take a shared lock. `reclaim` snapshots expired keys under the read
/// lock and then removes them one at a time, so writers are only ever held up
/// for a single removal.
pub struct MemoryStore<V> {
    name: String,
    entries: RwLock<HashMap<String, V>>,
}

impl<V: StoreValue> MemoryStore<V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_err(&self) -> anyhow::Error {
        anyhow!("Memory store '{}' lock poisoned", self.name)
    }
}

#[async_trait]
impl<V: StoreValue> ExpiringStore<V> for MemoryStore<V> {
    async fn put(&self, key: &str, value: V) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| self.lock_err())?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        let entries = self.entries.read().map_err(|_| self.lock_err())?;
        Ok(entries.get(key).filter(|v| !v.is_expired()).cloned())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let entries = self.entries.read().map_err(|_| self.lock_err())?;
        Ok(entries.get(key).is_some_and(|v| !v.is_expired()))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| self.lock_err())?;
        Ok(entries.remove(key).is_some())
    }

    async fn reclaim(&self) -> Result<usize> {
        let expired: Vec<String> = {
            let entries = self.entries.read().map_err(|_| self.lock_err())?;
            entries
                .iter()
                .filter(|(_, v)| v.is_expired())
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut reclaimed = 0;
        for key in expired {
            let mut entries = self.entries.write().map_err(|_| self.lock_err())?;
            // Re-check: the key may have been re-put with a fresh expiry.
            if entries.get(&key).is_some_and(|v| v.is_expired()) {
                entries.remove(&key);
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            debug!(store = %self.name, reclaimed, "Reclaimed expired entries");
        }
        Ok(reclaimed)
    }

    async fn len(&self) -> Result<usize> {
        let entries = self.entries.read().map_err(|_| self.lock_err())?;
        Ok(entries.len())
    }
}

//! Expiring store backed by a redb embedded database.
//!
//! Values are MessagePack encoded into a single named table. This is the
//! persistence adapter: it survives restarts but is not shared between nodes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::marker::PhantomData;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::{ExpiringStore, StoreValue};

/// redb-backed expiring store (key: entry id, value: MessagePack bytes).
pub struct PersistentStore<V> {
    db: Database,
    table: &'static str,
    _value: PhantomData<fn() -> V>,
}

impl<V: StoreValue> PersistentStore<V> {
    /// Open or create a store at `path`, using `table` as the table name.
    pub fn open(path: PathBuf, table: &'static str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open store database: {:?}", path))?;

        let store = Self {
            db,
            table,
            _value: PhantomData,
        };

        let write_txn = store.db.begin_write()?;
        {
            let _ = write_txn.open_table(store.definition())?;
        }
        write_txn.commit()?;

        debug!(path = ?path, table, "Opened persistent store");
        Ok(store)
    }

    fn definition(&self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        TableDefinition::new(self.table)
    }

    fn decode(bytes: &[u8]) -> Result<V> {
        rmp_serde::from_slice(bytes).context("Failed to deserialize store entry")
    }

    fn read(&self, key: &str) -> Result<Option<V>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;
        let value = match table.get(key)? {
            Some(value) => Some(Self::decode(value.value())?),
            None => None,
        };
        Ok(value)
    }
}

#[async_trait]
impl<V: StoreValue> ExpiringStore<V> for PersistentStore<V> {
    async fn put(&self, key: &str, value: V) -> Result<()> {
        let data = rmp_serde::to_vec_named(&value).context("Failed to serialize store entry")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(self.definition())?;
            table.insert(key, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.read(key)?.filter(|v| !v.is_expired()))
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.read(key)?.is_some_and(|v| !v.is_expired()))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(self.definition())?;
            let result = table.remove(key)?;
            result.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    async fn reclaim(&self) -> Result<usize> {
        // Snapshot candidates in a read transaction; writers are not blocked.
        let candidates: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(self.definition())?;

            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match Self::decode(value.value()) {
                    Ok(v) if v.is_expired() => keys.push(key.value().to_string()),
                    Err(e) => {
                        warn!(
                            table = self.table,
                            key = key.value(),
                            error = %e,
                            "Undecodable store entry, marking for deletion"
                        );
                        keys.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            keys
        };

        if candidates.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        let mut reclaimed = 0;
        {
            let mut table = write_txn.open_table(self.definition())?;
            for key in &candidates {
                // Re-check inside the write transaction; a fresh put wins.
                let still_expired = match table.get(key.as_str())? {
                    Some(value) => Self::decode(value.value())
                        .map(|v| v.is_expired())
                        .unwrap_or(true),
                    None => false,
                };
                if still_expired {
                    table.remove(key.as_str())?;
                    reclaimed += 1;
                }
            }
        }
        write_txn.commit()?;

        debug!(table = self.table, reclaimed, "Reclaimed expired entries");
        Ok(reclaimed)
    }

    async fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;
        Ok(table.len()? as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::Entry;
    use tempfile::tempdir;

    fn test_store() -> (PersistentStore<Entry>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.redb");
        let store = PersistentStore::open(path, "entries").unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let (store, _dir) = test_store();

        store.put("k1", Entry::live("v1")).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap().unwrap().value, "v1");
        assert!(store.contains("k1").await.unwrap());

        assert!(store.remove("k1").await.unwrap());
        assert!(store.get("k1").await.unwrap().is_none());
        assert!(!store.remove("k1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_reads_absent_until_reclaimed() {
        let (store, _dir) = test_store();

        store.put("old", Entry::expired("v")).await.unwrap();
        store.put("new", Entry::live("v")).await.unwrap();

        assert!(store.get("old").await.unwrap().is_none());
        assert!(!store.contains("old").await.unwrap());
        assert_eq!(store.len().await.unwrap(), 2);

        assert_eq!(store.reclaim().await.unwrap(), 1);
        assert_eq!(store.reclaim().await.unwrap(), 0);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.redb");

        {
            let store: PersistentStore<Entry> = PersistentStore::open(path.clone(), "entries").unwrap();
            store.put("k", Entry::live("kept")).await.unwrap();
        }

        let store: PersistentStore<Entry> = PersistentStore::open(path, "entries").unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().value, "kept");
    }
}

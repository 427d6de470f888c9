//! Expiring keyed stores.
//!
//! Every store in the broker (tickets, artifacts) is an [`ExpiringStore`]:
//! entries carry their own absolute expiry and are removed by `reclaim`,
//! normally driven by a background [`cleaner::Cleaner`].
//!
//! Three backends implement the contract:
//! - [`memory::MemoryStore`] for a single node
//! - [`persistent::PersistentStore`] backed by redb
//! - [`crate::cluster::ReplicatedStore`] shared across cluster nodes

pub mod cleaner;
pub mod memory;
pub mod persistent;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

pub use cleaner::{Cleaner, CleanerState, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use memory::MemoryStore;
pub use persistent::PersistentStore;

/// Compute the absolute expiry instant for an entry created now.
///
/// Saturates at the maximum representable instant for very large TTLs.
pub fn expiry_from_ttl(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A value that knows when it stops being valid.
pub trait Expiring {
    fn expire_at(&self) -> DateTime<Utc>;

    fn set_expire_at(&mut self, at: DateTime<Utc>);

    /// Expired once `now >= expire_at`.
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expire_at()
    }
}

/// Bounds shared by every value kept in a store.
pub trait StoreValue:
    Expiring + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> StoreValue for T where
    T: Expiring + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Keyed store whose entries expire.
///
/// Unknown keys are reported as absent (`None`/`false`), never as errors.
/// Errors always mean the backend itself failed.
#[async_trait]
pub trait ExpiringStore<V: StoreValue>: Send + Sync {
    /// Insert or overwrite `key`. The value's own `expire_at` is kept.
    async fn put(&self, key: &str, value: V) -> Result<()>;

    /// Fetch a live entry. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<V>>;

    /// Whether a live entry exists for `key`.
    async fn contains(&self, key: &str) -> Result<bool>;

    /// Remove `key`, returning whether anything was removed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Remove every entry with `expire_at <= now`, returning how many.
    async fn reclaim(&self) -> Result<usize>;

    /// Number of stored entries, expired ones included.
    async fn len(&self) -> Result<usize>;

    /// Stamp `value` with an expiry `ttl` from now and store it.
    async fn put_with_ttl(&self, key: &str, mut value: V, ttl: Duration) -> Result<()> {
        value.set_expire_at(expiry_from_ttl(ttl));
        self.put(key, value).await
    }
}

/// Something a [`Cleaner`] can reclaim.
#[async_trait]
pub trait Reclaim: Send + Sync {
    /// Short label used in log records.
    fn name(&self) -> &str;

    async fn reclaim(&self) -> Result<usize>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_from_ttl() {
        let before = Utc::now();
        let at = expiry_from_ttl(Duration::from_secs(60));
        assert!(at >= before + chrono::Duration::seconds(60));
        assert!(at <= Utc::now() + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_expiry_saturates() {
        let at = expiry_from_ttl(Duration::MAX);
        assert_eq!(at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_expired_at_boundary() {
        let mut entry = testing::Entry::live("x");
        assert!(!entry.is_expired());
        entry.set_expire_at(Utc::now());
        assert!(entry.is_expired());
    }
}

//! Ticket-granting-ticket store.
//!
//! Wraps an [`ExpiringStore`] of tickets with the SSO session lifecycle:
//! creation after successful authentication, requestors and methods joining,
//! requestors leaving, and expiry on logout.
//!
//! Every mutation is a read-modify-write of the whole ticket. Mutations of the
//! same ticket are serialized on this node through striped locks; across nodes
//! the last write wins.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::types::{
    AttributeValue, AuthnProfileEntry, Owner, TicketAttributes, TicketGrantingTicket, TicketId,
};
use crate::logout::AuthorityKind;
use crate::store::{ExpiringStore, Reclaim};

/// Number of lock stripes for per-ticket serialization.
const LOCK_STRIPES: usize = 64;

/// Attempts at drawing an unused ticket id before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

/// SSO session store.
pub struct TgtStore {
    backend: Arc<dyn ExpiringStore<TicketGrantingTicket>>,
    ttl: Duration,
    locks: Vec<Mutex<()>>,
}

impl TgtStore {
    pub fn new(backend: Arc<dyn ExpiringStore<TicketGrantingTicket>>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Configured ticket lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn lock(&self, id: &TicketId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.locks.len();
        self.locks[stripe].lock().await
    }

    /// Create a ticket for a freshly authenticated owner.
    pub async fn create(&self, owner: Owner, method: AuthnProfileEntry) -> Result<TicketGrantingTicket> {
        let mut ticket = TicketGrantingTicket::new(owner, method);

        let mut attempts = 0;
        while self.backend.contains(ticket.id.as_str()).await? {
            attempts += 1;
            if attempts >= MAX_ID_ATTEMPTS {
                return Err(anyhow!("Could not generate an unused ticket id"));
            }
            ticket.id = TicketId::generate();
        }

        let key = ticket.id.clone();
        let _guard = self.lock(&key).await;
        self.backend
            .put_with_ttl(key.as_str(), ticket.clone(), self.ttl)
            .await?;

        // Re-read to return the stored expiry.
        let stored = self
            .backend
            .get(key.as_str())
            .await?
            .ok_or_else(|| anyhow!("Ticket {} vanished right after creation", key))?;

        info!(
            authority = %AuthorityKind::TgtStore,
            ticket = %stored.id,
            user_id = %stored.owner.user_id,
            method = stored.authn_profile.first().map(|e| e.method_id.as_str()).unwrap_or_default(),
            "Ticket created"
        );
        Ok(stored)
    }

    /// Fetch a live ticket. Expired and unknown tickets are absent.
    pub async fn retrieve(&self, id: &TicketId) -> Result<Option<TicketGrantingTicket>> {
        self.backend.get(id.as_str()).await
    }

    /// Apply `mutate` to a live ticket and store it back if it reports a change.
    ///
    /// Returns `None` when the ticket is absent, otherwise the mutation's result
    /// and the ticket as stored.
    async fn modify<T, F>(&self, id: &TicketId, mutate: F) -> Result<Option<(T, TicketGrantingTicket)>>
    where
        F: FnOnce(&mut TicketGrantingTicket) -> (T, bool) + Send,
        T: Send,
    {
        let _guard = self.lock(id).await;
        let Some(mut ticket) = self.backend.get(id.as_str()).await? else {
            return Ok(None);
        };
        let (result, changed) = mutate(&mut ticket);
        if changed {
            self.backend.put(id.as_str(), ticket.clone()).await?;
        }
        Ok(Some((result, ticket)))
    }

    /// Register a requestor on the ticket.
    pub async fn add_requestor(&self, id: &TicketId, requestor: &str) -> Result<Option<TicketGrantingTicket>> {
        let updated = self
            .modify(id, |t| {
                let added = t.add_requestor(requestor);
                (added, added)
            })
            .await?;

        if let Some((true, _)) = updated {
            debug!(ticket = %id, requestor, "Requestor joined ticket");
        }
        Ok(updated.map(|(_, t)| t))
    }

    /// Unregister a requestor. Returns false, leaving the ticket untouched,
    /// when the requestor was not registered or the ticket is absent.
    pub async fn remove_requestor(&self, id: &TicketId, requestor: &str) -> Result<bool> {
        let removed = self
            .modify(id, |t| {
                let removed = t.remove_requestor(requestor);
                (removed, removed)
            })
            .await?
            .is_some_and(|(removed, _)| removed);

        if removed {
            debug!(ticket = %id, requestor, "Requestor left ticket");
        }
        Ok(removed)
    }

    /// Record another authentication method on the ticket.
    pub async fn add_authn_profile(
        &self,
        id: &TicketId,
        entry: AuthnProfileEntry,
    ) -> Result<Option<TicketGrantingTicket>> {
        let method = entry.method_id.clone();
        let updated = self
            .modify(id, |t| {
                t.add_authn_profile(entry);
                ((), true)
            })
            .await?;

        if updated.is_some() {
            info!(
                authority = %AuthorityKind::AuthenticationMethod,
                ticket = %id,
                method = %method,
                "Authentication method added to ticket"
            );
        }
        Ok(updated.map(|(_, t)| t))
    }

    /// Set a namespaced attribute. Returns false when the ticket is absent.
    pub async fn set_attribute(
        &self,
        id: &TicketId,
        consumer_class: &str,
        component_id: &str,
        name: &str,
        value: AttributeValue,
    ) -> Result<bool> {
        let updated = self
            .modify(id, |t| {
                t.attributes.put(consumer_class, component_id, name, value);
                ((), true)
            })
            .await?;
        Ok(updated.is_some())
    }

    /// Namespaced attributes of a live ticket.
    pub async fn attributes(&self, id: &TicketId) -> Result<Option<TicketAttributes>> {
        Ok(self.retrieve(id).await?.map(|t| t.attributes))
    }

    /// Expire a ticket so no later retrieval succeeds.
    ///
    /// The entry stays in the backend until reclaimed. Returns false when the
    /// ticket was already absent.
    pub async fn expire(&self, id: &TicketId) -> Result<bool> {
        let expired = self
            .modify(id, |t| {
                t.expire();
                ((), true)
            })
            .await?
            .is_some();

        if expired {
            info!(authority = %AuthorityKind::TgtStore, ticket = %id, "Ticket expired");
        }
        Ok(expired)
    }

    /// Number of stored tickets, expired ones not yet reclaimed included.
    pub async fn count(&self) -> Result<usize> {
        self.backend.len().await
    }
}

#[async_trait]
impl Reclaim for TgtStore {
    fn name(&self) -> &str {
        "tgt"
    }

    async fn reclaim(&self) -> Result<usize> {
        self.backend.reclaim().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store() -> TgtStore {
        TgtStore::new(
            Arc::new(MemoryStore::<TicketGrantingTicket>::new("tgt")),
            Duration::from_secs(3600),
        )
    }

    async fn create(store: &TgtStore) -> TicketGrantingTicket {
        store
            .create(
                Owner::new("alice").with_organization("example"),
                AuthnProfileEntry::new("password"),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_retrieve() {
        let store = store();
        let ticket = create(&store).await;

        assert!(!crate::store::Expiring::is_expired(&ticket));
        let fetched = store.retrieve(&ticket.id).await.unwrap().unwrap();
        assert_eq!(fetched.owner.user_id, "alice");
        assert_eq!(fetched.owner.organization.as_deref(), Some("example"));
        assert!(fetched.requestors.is_empty());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_absent() {
        let store = store();
        let id = TicketId::generate();

        assert!(store.retrieve(&id).await.unwrap().is_none());
        assert!(store.add_requestor(&id, "sp1").await.unwrap().is_none());
        assert!(!store.remove_requestor(&id, "sp1").await.unwrap());
        assert!(!store.expire(&id).await.unwrap());
        assert!(store.attributes(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requestors_join_and_leave() {
        let store = store();
        let ticket = create(&store).await;

        store.add_requestor(&ticket.id, "sp1").await.unwrap();
        let updated = store.add_requestor(&ticket.id, "sp2").await.unwrap().unwrap();
        assert_eq!(updated.requestors.len(), 2);

        assert!(store.remove_requestor(&ticket.id, "sp1").await.unwrap());
        let fetched = store.retrieve(&ticket.id).await.unwrap().unwrap();
        assert_eq!(fetched.requestors.iter().collect::<Vec<_>>(), vec!["sp2"]);
    }

    #[tokio::test]
    async fn test_remove_absent_requestor_is_noop() {
        let store = store();
        let ticket = create(&store).await;
        store.add_requestor(&ticket.id, "sp1").await.unwrap();
        let before = store.retrieve(&ticket.id).await.unwrap().unwrap();

        assert!(!store.remove_requestor(&ticket.id, "sp9").await.unwrap());

        let after = store.retrieve(&ticket.id).await.unwrap().unwrap();
        assert_eq!(before.requestors, after.requestors);
        assert_eq!(before.expire_at, after.expire_at);
    }

    #[tokio::test]
    async fn test_ticket_without_requestors_stays_valid() {
        let store = store();
        let ticket = create(&store).await;
        store.add_requestor(&ticket.id, "sp1").await.unwrap();
        store.remove_requestor(&ticket.id, "sp1").await.unwrap();

        assert!(store.retrieve(&ticket.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_add_authn_profile() {
        let store = store();
        let ticket = create(&store).await;

        let updated = store
            .add_authn_profile(&ticket.id, AuthnProfileEntry::new("otp").with_context("level", "2"))
            .await
            .unwrap()
            .unwrap();
        assert!(updated.has_method("password"));
        assert!(updated.has_method("otp"));
    }

    #[tokio::test]
    async fn test_expire_then_reclaim() {
        let store = store();
        let ticket = create(&store).await;

        assert!(store.expire(&ticket.id).await.unwrap());
        assert!(store.retrieve(&ticket.id).await.unwrap().is_none());
        assert!(!store.expire(&ticket.id).await.unwrap());

        assert_eq!(Reclaim::reclaim(&store).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_attributes() {
        let store = store();
        let ticket = create(&store).await;

        assert!(store
            .set_attribute(&ticket.id, "saml2.sso", "sp-profile", "session_index", "idx-1".into())
            .await
            .unwrap());

        let attrs = store.attributes(&ticket.id).await.unwrap().unwrap();
        assert_eq!(
            attrs
                .get("saml2.sso", "sp-profile", "session_index")
                .and_then(|v| v.first()),
            Some("idx-1")
        );
    }

    #[tokio::test]
    async fn test_concurrent_joins_are_not_lost() {
        let store = Arc::new(store());
        let ticket = create(&store).await;

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            let id = ticket.id.clone();
            handles.push(tokio::spawn(async move {
                store.add_requestor(&id, &format!("sp{i}")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let fetched = store.retrieve(&ticket.id).await.unwrap().unwrap();
        assert_eq!(fetched.requestors.len(), 32);
    }
}

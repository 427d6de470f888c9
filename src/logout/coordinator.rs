//! Multi-party logout.
//!
//! The coordinator expires the ticket first, so no node can use it again,
//! then ends every remote session registered on it. Remote calls run
//! concurrently, each bounded by its own timeout, and their results are
//! folded into a single [`LogoutOutcome`]. A failed expiry does not stop the
//! remote calls; it is reported as a step of its own.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{AuthorityKind, LogoutOutcome, LogoutReport, LogoutStep, LogoutTrigger, StepStatus};
use crate::tgt::{TgtStore, TicketGrantingTicket, TicketId};

/// Step target naming the ticket store itself.
pub const TGT_STORE_TARGET: &str = "tgt-store";

/// Ends a session held by a remote party (authentication method or requestor).
#[async_trait]
pub trait RemoteLogout: Send + Sync {
    async fn logout(&self, ticket: &TicketGrantingTicket) -> Result<()>;
}

/// Drives logout for tickets in one [`TgtStore`].
pub struct LogoutCoordinator {
    tgt_store: Arc<TgtStore>,
    methods: HashMap<String, Arc<dyn RemoteLogout>>,
    requestors: HashMap<String, Arc<dyn RemoteLogout>>,
    call_timeout: Duration,
}

impl LogoutCoordinator {
    pub fn new(tgt_store: Arc<TgtStore>, call_timeout: Duration) -> Self {
        Self {
            tgt_store,
            methods: HashMap::new(),
            requestors: HashMap::new(),
            call_timeout,
        }
    }

    /// Register an authentication method that supports asynchronous logout.
    pub fn register_method(&mut self, method_id: impl Into<String>, handler: Arc<dyn RemoteLogout>) {
        self.methods.insert(method_id.into(), handler);
    }

    /// Register a requestor that accepts back-channel logout.
    pub fn register_requestor(&mut self, requestor: impl Into<String>, handler: Arc<dyn RemoteLogout>) {
        self.requestors.insert(requestor.into(), handler);
    }

    /// Whether `method_id` has a remote logout step.
    pub fn supports_remote_logout(&self, method_id: &str) -> bool {
        self.methods.contains_key(method_id)
    }

    /// Log the owner of `ticket_id` out everywhere.
    ///
    /// Returns `None` for an unknown or already expired ticket. Partial and
    /// total failure are outcomes in the report, not errors; `Err` means the
    /// ticket could not be read.
    pub async fn submit(&self, ticket_id: &TicketId, trigger: LogoutTrigger) -> Result<Option<LogoutReport>> {
        let Some(ticket) = self.tgt_store.retrieve(ticket_id).await? else {
            debug!(ticket = %ticket_id, "Logout for unknown or expired ticket");
            return Ok(None);
        };

        info!(
            authority = %trigger.authority_kind(),
            ticket = %ticket_id,
            user_id = %ticket.owner.user_id,
            methods = ticket.authn_profile.len(),
            requestors = ticket.requestors.len(),
            "Logout started"
        );

        let mut steps = Vec::new();
        if let Err(e) = self.tgt_store.expire(ticket_id).await {
            warn!(
                authority = %AuthorityKind::TgtStore,
                ticket = %ticket_id,
                error = %e,
                "Failed to expire ticket during logout"
            );
            steps.push(step(
                TGT_STORE_TARGET,
                AuthorityKind::TgtStore,
                StepStatus::Failed(format!("{e:#}")),
            ));
        }

        let mut pending: Vec<(String, AuthorityKind, JoinHandle<StepStatus>)> = Vec::new();
        let initiator = trigger.initiator();

        for entry in &ticket.authn_profile {
            let method = &entry.method_id;
            let kind = AuthorityKind::AuthenticationMethod;
            match self.methods.get(method) {
                None => steps.push(step(method, kind, StepStatus::Local)),
                Some(_) if initiator == Some(method.as_str()) => {
                    steps.push(step(method, kind, StepStatus::Skipped))
                }
                Some(handler) => pending.push((method.clone(), kind, self.spawn_call(handler, &ticket))),
            }
        }

        for requestor in &ticket.requestors {
            let kind = AuthorityKind::Requestor;
            match self.requestors.get(requestor) {
                None => {}
                Some(_) if initiator == Some(requestor.as_str()) => {
                    steps.push(step(requestor, kind, StepStatus::Skipped))
                }
                Some(handler) => pending.push((requestor.clone(), kind, self.spawn_call(handler, &ticket))),
            }
        }

        for (target, kind, handle) in pending {
            let status = handle
                .await
                .unwrap_or_else(|e| StepStatus::Failed(format!("logout task failed: {e}")));

            if status.is_success() {
                debug!(authority = %kind, target = %target, ticket = %ticket_id, "Remote logout completed");
            } else {
                warn!(
                    authority = %kind,
                    target = %target,
                    ticket = %ticket_id,
                    status = ?status,
                    "Remote logout failed"
                );
            }
            steps.push(step(&target, kind, status));
        }

        let outcome = LogoutOutcome::aggregate(&steps);
        match outcome {
            LogoutOutcome::Success => info!(ticket = %ticket_id, outcome = %outcome, "Logout finished"),
            _ => warn!(
                ticket = %ticket_id,
                outcome = %outcome,
                failed = steps.iter().filter(|s| !s.status.is_success()).count(),
                "Logout finished with orphaned remote sessions"
            ),
        }

        Ok(Some(LogoutReport {
            ticket: ticket_id.clone(),
            user_id: ticket.owner.user_id.clone(),
            trigger,
            outcome,
            steps,
        }))
    }

    /// A single requestor leaves the session; the ticket stays valid.
    pub async fn leave(&self, ticket_id: &TicketId, requestor: &str) -> Result<bool> {
        let removed = self.tgt_store.remove_requestor(ticket_id, requestor).await?;
        if removed {
            info!(
                authority = %AuthorityKind::Requestor,
                ticket = %ticket_id,
                requestor,
                "Requestor logged out of session"
            );
        }
        Ok(removed)
    }

    fn spawn_call(&self, handler: &Arc<dyn RemoteLogout>, ticket: &TicketGrantingTicket) -> JoinHandle<StepStatus> {
        let handler = Arc::clone(handler);
        let ticket = ticket.clone();
        let timeout = self.call_timeout;

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, handler.logout(&ticket)).await {
                Ok(Ok(())) => StepStatus::Completed,
                Ok(Err(e)) => StepStatus::Failed(e.to_string()),
                Err(_) => StepStatus::TimedOut,
            }
        })
    }
}

fn step(target: &str, kind: AuthorityKind, status: StepStatus) -> LogoutStep {
    LogoutStep {
        target: target.to_string(),
        kind,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExpiringStore, MemoryStore};
    use crate::tgt::{AuthnProfileEntry, Owner};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Remote party with a fixed behavior.
    enum Remote {
        Ok,
        Fail,
        Hang,
    }

    struct FakeRemote {
        behavior: Remote,
        calls: AtomicUsize,
    }

    impl FakeRemote {
        fn new(behavior: Remote) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteLogout for FakeRemote {
        async fn logout(&self, _ticket: &TicketGrantingTicket) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Remote::Ok => Ok(()),
                Remote::Fail => Err(anyhow!("remote session service unavailable")),
                Remote::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    fn tgt_store() -> Arc<TgtStore> {
        Arc::new(TgtStore::new(
            Arc::new(MemoryStore::<TicketGrantingTicket>::new("tgt")),
            Duration::from_secs(3600),
        ))
    }

    async fn ticket_with(store: &TgtStore, methods: &[&str], requestors: &[&str]) -> TicketId {
        let ticket = store
            .create(Owner::new("alice"), AuthnProfileEntry::new(methods[0]))
            .await
            .unwrap();
        for method in &methods[1..] {
            store
                .add_authn_profile(&ticket.id, AuthnProfileEntry::new(*method))
                .await
                .unwrap();
        }
        for requestor in requestors {
            store.add_requestor(&ticket.id, requestor).await.unwrap();
        }
        ticket.id
    }

    #[tokio::test]
    async fn test_partial_failure_still_expires_ticket() {
        let store = tgt_store();
        let id = ticket_with(&store, &["m1", "m2"], &["A", "B"]).await;

        let mut coordinator = LogoutCoordinator::new(store.clone(), Duration::from_secs(1));
        coordinator.register_method("m2", FakeRemote::new(Remote::Fail));

        let report = coordinator
            .submit(&id, LogoutTrigger::Explicit { requestor: "A".to_string() })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.outcome, LogoutOutcome::PartialFailure);
        assert_eq!(report.failed_targets(), vec!["m2"]);
        assert!(store.retrieve(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_only_methods_succeed() {
        let store = tgt_store();
        let id = ticket_with(&store, &["password", "otp"], &["A"]).await;

        let coordinator = LogoutCoordinator::new(store.clone(), Duration::from_secs(1));
        let report = coordinator
            .submit(&id, LogoutTrigger::Administrative)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.outcome, LogoutOutcome::Success);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Local));
        assert!(store.retrieve(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_all_remote_failures_is_total_failure() {
        let store = tgt_store();
        let id = ticket_with(&store, &["idp-a", "idp-b"], &[]).await;

        let mut coordinator = LogoutCoordinator::new(store.clone(), Duration::from_secs(1));
        coordinator.register_method("idp-a", FakeRemote::new(Remote::Fail));
        coordinator.register_method("idp-b", FakeRemote::new(Remote::Fail));

        let report = coordinator
            .submit(&id, LogoutTrigger::Administrative)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, LogoutOutcome::Failure);
        assert!(store.retrieve(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_triggering_authority_not_called_back() {
        let store = tgt_store();
        let id = ticket_with(&store, &["remote-idp"], &[]).await;

        let remote = FakeRemote::new(Remote::Ok);
        let mut coordinator = LogoutCoordinator::new(store.clone(), Duration::from_secs(1));
        coordinator.register_method("remote-idp", remote.clone());

        let report = coordinator
            .submit(
                &id,
                LogoutTrigger::RemoteNotification {
                    authority: "remote-idp".to_string(),
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.outcome, LogoutOutcome::Success);
        assert_eq!(report.steps[0].status, StepStatus::Skipped);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slow_authority_times_out_without_blocking_expiry() {
        let store = tgt_store();
        let id = ticket_with(&store, &["slow", "fast"], &[]).await;

        let fast = FakeRemote::new(Remote::Ok);
        let mut coordinator = LogoutCoordinator::new(store.clone(), Duration::from_millis(50));
        coordinator.register_method("slow", FakeRemote::new(Remote::Hang));
        coordinator.register_method("fast", fast.clone());
        let coordinator = Arc::new(coordinator);

        let running = {
            let coordinator = Arc::clone(&coordinator);
            let id = id.clone();
            tokio::spawn(async move { coordinator.submit(&id, LogoutTrigger::Administrative).await })
        };

        // Expired while the slow call is still outstanding
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.retrieve(&id).await.unwrap().is_none());

        let report = running.await.unwrap().unwrap().unwrap();
        assert_eq!(report.outcome, LogoutOutcome::PartialFailure);
        assert_eq!(fast.calls.load(Ordering::SeqCst), 1);
        let slow = report.steps.iter().find(|s| s.target == "slow").unwrap();
        assert_eq!(slow.status, StepStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_requestor_back_channel() {
        let store = tgt_store();
        let id = ticket_with(&store, &["password"], &["sp-a", "sp-b", "sp-c"]).await;

        let sp_b = FakeRemote::new(Remote::Ok);
        let mut coordinator = LogoutCoordinator::new(store.clone(), Duration::from_secs(1));
        coordinator.register_requestor("sp-a", FakeRemote::new(Remote::Ok));
        coordinator.register_requestor("sp-b", sp_b.clone());

        let report = coordinator
            .submit(&id, LogoutTrigger::Explicit { requestor: "sp-a".to_string() })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.outcome, LogoutOutcome::Success);
        // password (local), sp-a (initiator, skipped), sp-b (called); sp-c has no back channel
        assert_eq!(report.steps.len(), 3);
        assert_eq!(sp_b.calls.load(Ordering::SeqCst), 1);
    }

    /// Ticket backend whose writes can be switched off.
    struct ReadOnlyAfter {
        inner: MemoryStore<TicketGrantingTicket>,
        reject_writes: AtomicBool,
    }

    #[async_trait]
    impl ExpiringStore<TicketGrantingTicket> for ReadOnlyAfter {
        async fn put(&self, key: &str, value: TicketGrantingTicket) -> Result<()> {
            if self.reject_writes.load(Ordering::SeqCst) {
                return Err(anyhow!("replication timed out"));
            }
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &str) -> Result<Option<TicketGrantingTicket>> {
            self.inner.get(key).await
        }

        async fn contains(&self, key: &str) -> Result<bool> {
            self.inner.contains(key).await
        }

        async fn remove(&self, key: &str) -> Result<bool> {
            self.inner.remove(key).await
        }

        async fn reclaim(&self) -> Result<usize> {
            self.inner.reclaim().await
        }

        async fn len(&self) -> Result<usize> {
            self.inner.len().await
        }
    }

    #[tokio::test]
    async fn test_expiry_failure_still_fans_out() {
        let backend = Arc::new(ReadOnlyAfter {
            inner: MemoryStore::new("tgt"),
            reject_writes: AtomicBool::new(false),
        });
        let store = Arc::new(TgtStore::new(backend.clone(), Duration::from_secs(3600)));
        let id = ticket_with(&store, &["remote-idp"], &[]).await;
        backend.reject_writes.store(true, Ordering::SeqCst);

        let remote = FakeRemote::new(Remote::Ok);
        let mut coordinator = LogoutCoordinator::new(store.clone(), Duration::from_secs(1));
        coordinator.register_method("remote-idp", remote.clone());

        let report = coordinator
            .submit(&id, LogoutTrigger::Administrative)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.outcome, LogoutOutcome::PartialFailure);
        assert_eq!(report.failed_targets(), vec![TGT_STORE_TARGET]);
        assert_eq!(report.steps[0].kind, AuthorityKind::TgtStore);
    }

    #[tokio::test]
    async fn test_unknown_ticket() {
        let coordinator = LogoutCoordinator::new(tgt_store(), Duration::from_secs(1));
        let result = coordinator
            .submit(&TicketId::generate(), LogoutTrigger::Administrative)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_leave_keeps_session() {
        let store = tgt_store();
        let id = ticket_with(&store, &["password"], &["sp-a", "sp-b"]).await;
        let coordinator = LogoutCoordinator::new(store.clone(), Duration::from_secs(1));

        assert!(coordinator.leave(&id, "sp-a").await.unwrap());
        assert!(!coordinator.leave(&id, "sp-a").await.unwrap());

        let ticket = store.retrieve(&id).await.unwrap().unwrap();
        assert_eq!(ticket.requestors.len(), 1);
    }
}

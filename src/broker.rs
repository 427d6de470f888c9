//! Broker assembly: stores, replication, cleaners and logout, built from one
//! explicit [`BrokerConfig`].

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::artifact::{ArtifactMapEntry, ArtifactStore};
use crate::cluster::{ChannelRegistry, GroupTransport, ReplicatedStore};
use crate::config::{BrokerConfig, StoreBackend, StoreConfig};
use crate::logout::{HttpRemoteLogout, LogoutCoordinator};
use crate::store::{Cleaner, ExpiringStore, MemoryStore, PersistentStore, StoreValue};
use crate::tgt::{TgtStore, TicketGrantingTicket};

/// redb table holding tickets.
const TGT_TABLE: &str = "tgt";

/// redb table holding artifacts.
const ARTIFACT_TABLE: &str = "artifacts";

/// A running broker node.
///
/// Owns its stores and background cleaners; nothing outlives it.
pub struct Broker {
    config: BrokerConfig,
    registry: ChannelRegistry,
    tgt_store: Arc<TgtStore>,
    artifact_store: Arc<ArtifactStore>,
    logout: Arc<LogoutCoordinator>,
    cleaners: Vec<Cleaner>,
}

impl Broker {
    /// Validate `config`, join the configured clusters, open the stores and
    /// start one cleaner per store.
    pub async fn start(config: BrokerConfig, transport: Arc<dyn GroupTransport>) -> Result<Self> {
        config.validate().map_err(|e| anyhow!(e))?;

        let registry = ChannelRegistry::build(transport, &config.clusters).await?;

        let tgt_backend = open_backend::<TicketGrantingTicket>(&config.tgt, TGT_TABLE, &registry)?;
        let tgt_store = Arc::new(TgtStore::new(tgt_backend, config.tgt.ttl()));

        let artifact_backend =
            open_backend::<ArtifactMapEntry>(&config.artifact, ARTIFACT_TABLE, &registry)?;
        let artifact_store = Arc::new(ArtifactStore::new(artifact_backend, config.artifact.ttl()));

        let call_timeout = config.logout.call_timeout();
        let mut logout = LogoutCoordinator::new(Arc::clone(&tgt_store), call_timeout);
        for endpoint in &config.logout.methods {
            logout.register_method(&endpoint.id, Arc::new(HttpRemoteLogout::new(&endpoint.url, call_timeout)?));
        }
        for endpoint in &config.logout.requestors {
            logout.register_requestor(&endpoint.id, Arc::new(HttpRemoteLogout::new(&endpoint.url, call_timeout)?));
        }

        let cleaners = vec![
            Cleaner::spawn(tgt_store.clone(), config.tgt.cleanup_interval()),
            Cleaner::spawn(artifact_store.clone(), config.artifact.cleanup_interval()),
        ];

        info!(
            tgt_backend = %config.tgt.backend,
            artifact_backend = %config.artifact.backend,
            clusters = registry.len(),
            remote_logout_methods = config.logout.methods.len(),
            remote_logout_requestors = config.logout.requestors.len(),
            "Broker started"
        );

        Ok(Self {
            config,
            registry,
            tgt_store,
            artifact_store,
            logout: Arc::new(logout),
            cleaners,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn tgt_store(&self) -> &Arc<TgtStore> {
        &self.tgt_store
    }

    pub fn artifact_store(&self) -> &Arc<ArtifactStore> {
        &self.artifact_store
    }

    pub fn logout(&self) -> &Arc<LogoutCoordinator> {
        &self.logout
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Stop the cleaners and leave every cluster.
    pub async fn shutdown(self) {
        for cleaner in self.cleaners {
            cleaner.stop().await;
        }
        self.registry.shutdown();
        info!("Broker stopped");
    }
}

fn open_backend<V: StoreValue>(
    config: &StoreConfig,
    table: &'static str,
    registry: &ChannelRegistry,
) -> Result<Arc<dyn ExpiringStore<V>>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::<V>::new(table))),
        StoreBackend::Persistent => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| anyhow!("Store '{}' has no database path", table))?;
            Ok(Arc::new(PersistentStore::<V>::open(PathBuf::from(path), table)?))
        }
        StoreBackend::Replicated => {
            let cluster_id = config
                .cluster_id
                .as_deref()
                .ok_or_else(|| anyhow!("Store '{}' has no cluster id", table))?;
            let channel = registry
                .get(cluster_id)
                .ok_or_else(|| anyhow!("Cluster '{}' is not connected", cluster_id))?;
            Ok(Arc::new(ReplicatedStore::<V>::new(channel)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalGroup;
    use crate::config::ClusterConfig;
    use crate::logout::{LogoutOutcome, LogoutTrigger};
    use crate::tgt::{AuthnProfileEntry, Owner};
    use tempfile::tempdir;

    fn replicated_config() -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.clusters = vec![ClusterConfig::new("sso-tgt"), ClusterConfig::new("sso-artifacts")];
        config.tgt.backend = StoreBackend::Replicated;
        config.tgt.cluster_id = Some("sso-tgt".to_string());
        config.artifact.backend = StoreBackend::Replicated;
        config.artifact.cluster_id = Some("sso-artifacts".to_string());
        config
    }

    #[tokio::test]
    async fn test_memory_broker_session_flow() {
        let broker = Broker::start(BrokerConfig::default(), Arc::new(LocalGroup::new()))
            .await
            .unwrap();

        let ticket = broker
            .tgt_store()
            .create(Owner::new("alice"), AuthnProfileEntry::new("password"))
            .await
            .unwrap();
        broker.tgt_store().add_requestor(&ticket.id, "sp1").await.unwrap();

        let artifact = broker
            .artifact_store()
            .issue("broker", "sp1", b"assertion".to_vec())
            .await
            .unwrap();
        assert!(broker.artifact_store().redeem(&artifact.artifact).await.unwrap().is_some());

        let report = broker
            .logout()
            .submit(&ticket.id, LogoutTrigger::Explicit { requestor: "sp1".to_string() })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, LogoutOutcome::Success);
        assert!(broker.tgt_store().retrieve(&ticket.id).await.unwrap().is_none());

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_replicated_brokers_share_sessions() {
        let group: Arc<dyn GroupTransport> = Arc::new(LocalGroup::new());
        let node_a = Broker::start(replicated_config(), group.clone()).await.unwrap();
        let node_b = Broker::start(replicated_config(), group.clone()).await.unwrap();

        let ticket = node_a
            .tgt_store()
            .create(Owner::new("alice"), AuthnProfileEntry::new("password"))
            .await
            .unwrap();

        // SSO on another node
        let joined = node_b.tgt_store().add_requestor(&ticket.id, "sp2").await.unwrap().unwrap();
        assert!(joined.requestors.contains("sp2"));

        // Artifact issued on one node, redeemed on the other
        let artifact = node_a
            .artifact_store()
            .issue("broker", "sp2", b"response".to_vec())
            .await
            .unwrap();
        assert!(node_b.artifact_store().redeem(&artifact.artifact).await.unwrap().is_some());
        assert!(node_a.artifact_store().redeem(&artifact.artifact).await.unwrap().is_none());

        // Logout on b expires the ticket for a as well
        node_b
            .logout()
            .submit(&ticket.id, LogoutTrigger::Administrative)
            .await
            .unwrap()
            .unwrap();
        assert!(node_a.tgt_store().retrieve(&ticket.id).await.unwrap().is_none());

        node_b.shutdown().await;
        node_a.shutdown().await;
    }

    #[tokio::test]
    async fn test_persistent_broker() {
        let dir = tempdir().unwrap();
        let mut config = BrokerConfig::default();
        config.tgt.backend = StoreBackend::Persistent;
        config.tgt.path = Some(dir.path().join("tgt.redb").to_string_lossy().into_owned());

        let broker = Broker::start(config, Arc::new(LocalGroup::new())).await.unwrap();
        let ticket = broker
            .tgt_store()
            .create(Owner::new("bob"), AuthnProfileEntry::new("password"))
            .await
            .unwrap();
        assert!(broker.tgt_store().retrieve(&ticket.id).await.unwrap().is_some());
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = BrokerConfig::default();
        config.tgt.backend = StoreBackend::Replicated;
        assert!(Broker::start(config, Arc::new(LocalGroup::new())).await.is_err());
    }
}

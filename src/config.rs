//! Broker configuration.
//!
//! A single [`BrokerConfig`] is built at startup (from a JSON file plus CLI
//! overrides) and handed to [`crate::broker::Broker::start`]. Nothing reads
//! configuration from process-global state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::store::DEFAULT_CLEANUP_INTERVAL_SECS;

/// Backing implementation for an expiring store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map, lost on restart.
    Memory,
    /// redb database file.
    #[serde(alias = "relational")]
    Persistent,
    /// Replicated map shared by every node of a cluster.
    Replicated,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Persistent => write!(f, "persistent"),
            StoreBackend::Replicated => write!(f, "replicated"),
        }
    }
}

/// Configuration of one expiring store (TGT or artifact).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Which backend holds the entries.
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Time-to-live applied to new entries, in seconds.
    pub ttl_secs: u64,

    /// Interval between reclaim cycles, in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Database file for the persistent backend.
    #[serde(default)]
    pub path: Option<String>,

    /// Cluster id for the replicated backend.
    #[serde(default)]
    pub cluster_id: Option<String>,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}

fn default_tgt_ttl() -> u64 {
    60 * 60 // 1 hour
}

fn default_artifact_ttl() -> u64 {
    5 * 60 // 5 minutes
}

impl StoreConfig {
    fn with_ttl(ttl_secs: u64) -> Self {
        Self {
            backend: default_backend(),
            ttl_secs,
            cleanup_interval_secs: default_cleanup_interval(),
            path: None,
            cluster_id: None,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    fn validate(&self, name: &str, clusters: &[ClusterConfig]) -> Result<(), String> {
        if self.ttl_secs == 0 {
            return Err(format!("{name}.ttl_secs must be greater than zero"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(format!(
                "{name}.cleanup_interval_secs must be greater than zero"
            ));
        }

        match self.backend {
            StoreBackend::Memory => Ok(()),
            StoreBackend::Persistent => match self.path {
                Some(ref p) if !p.is_empty() => Ok(()),
                _ => Err(format!("{name}.path is required for the persistent backend")),
            },
            StoreBackend::Replicated => {
                let id = self.cluster_id.as_deref().ok_or_else(|| {
                    format!("{name}.cluster_id is required for the replicated backend")
                })?;
                if clusters.iter().any(|c| c.id == id) {
                    Ok(())
                } else {
                    Err(format!("{name}.cluster_id '{id}' is not a configured cluster"))
                }
            }
        }
    }
}

/// Replication settings for one named cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster name; nodes with the same name share one replicated map.
    pub id: String,

    /// Wait for every peer to acknowledge an update before returning.
    #[serde(default = "default_true")]
    pub blocking_updates: bool,

    /// Upper bound on a blocking update, in milliseconds.
    #[serde(default = "default_update_timeout")]
    pub update_timeout_ms: u64,

    /// Upper bound on the join-time state transfer, in milliseconds.
    #[serde(default = "default_state_transfer_timeout")]
    pub state_transfer_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_update_timeout() -> u64 {
    5_000
}

fn default_state_transfer_timeout() -> u64 {
    100_000
}

impl ClusterConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            blocking_updates: default_true(),
            update_timeout_ms: default_update_timeout(),
            state_transfer_timeout_ms: default_state_transfer_timeout(),
        }
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }

    pub fn state_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.state_transfer_timeout_ms)
    }
}

/// Another broker process on the cluster network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// The peer's `network.node_id`.
    pub id: String,

    /// Address the peer accepts cluster connections on.
    pub addr: SocketAddr,
}

/// TCP cluster network joining broker processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Name of this process; unique across the cluster.
    pub node_id: String,

    /// Address to accept peer connections on.
    pub listen: SocketAddr,

    /// Every other broker process.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Delay between connection attempts to an unreachable peer, in milliseconds.
    #[serde(default = "default_reconnect")]
    pub reconnect_ms: u64,

    /// How long startup waits for the peers to connect, in milliseconds.
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,
}

fn default_reconnect() -> u64 {
    1_000
}

fn default_discovery_timeout() -> u64 {
    3_000
}

impl NetworkConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    fn validate(&self) -> Result<(), String> {
        if self.node_id.is_empty() {
            return Err("network.node_id must not be empty".to_string());
        }
        if self.reconnect_ms == 0 {
            return Err("network.reconnect_ms must be greater than zero".to_string());
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id.is_empty() {
                return Err("network peer id must not be empty".to_string());
            }
            if peer.id == self.node_id {
                return Err(format!("network peer '{}' is this node", peer.id));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(format!("duplicate network peer '{}'", peer.id));
            }
        }
        Ok(())
    }
}

/// Back-channel endpoint used to end a remote session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteLogoutEndpoint {
    /// Authentication method or requestor id the endpoint belongs to.
    pub id: String,

    /// Logout URL; `ticket` and `user` are appended as query parameters.
    pub url: String,
}

/// Logout coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogoutConfig {
    /// Timeout for each remote logout call, in milliseconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Authentication methods that support asynchronous remote logout.
    #[serde(default)]
    pub methods: Vec<RemoteLogoutEndpoint>,

    /// Requestors that accept back-channel logout notifications.
    #[serde(default)]
    pub requestors: Vec<RemoteLogoutEndpoint>,
}

fn default_call_timeout() -> u64 {
    10_000
}

impl Default for LogoutConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout(),
            methods: Vec::new(),
            requestors: Vec::new(),
        }
    }
}

impl LogoutConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Ticket-granting-ticket store.
    #[serde(default = "default_tgt_store")]
    pub tgt: StoreConfig,

    /// Artifact store.
    #[serde(default = "default_artifact_store")]
    pub artifact: StoreConfig,

    /// Clusters this node joins.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    /// Network linking this process to the other cluster nodes.
    #[serde(default)]
    pub network: Option<NetworkConfig>,

    /// Logout coordinator.
    #[serde(default)]
    pub logout: LogoutConfig,
}

fn default_tgt_store() -> StoreConfig {
    StoreConfig::with_ttl(default_tgt_ttl())
}

fn default_artifact_store() -> StoreConfig {
    StoreConfig::with_ttl(default_artifact_ttl())
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tgt: default_tgt_store(),
            artifact: default_artifact_store(),
            clusters: Vec::new(),
            network: None,
            logout: LogoutConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        for (i, cluster) in self.clusters.iter().enumerate() {
            if cluster.id.is_empty() {
                return Err("cluster id must not be empty".to_string());
            }
            if self.clusters[..i].iter().any(|c| c.id == cluster.id) {
                return Err(format!("duplicate cluster id '{}'", cluster.id));
            }
        }

        self.tgt.validate("tgt", &self.clusters)?;
        self.artifact.validate("artifact", &self.clusters)?;

        if self.tgt.backend == StoreBackend::Persistent
            && self.artifact.backend == StoreBackend::Persistent
            && self.tgt.path == self.artifact.path
        {
            return Err("tgt and artifact stores must use different database files".to_string());
        }

        if let Some(ref network) = self.network {
            network.validate()?;
        }

        if self.logout.call_timeout_ms == 0 {
            return Err("logout.call_timeout_ms must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Whether any store keeps its entries in a replicated map.
    pub fn uses_replication(&self) -> bool {
        self.tgt.backend == StoreBackend::Replicated
            || self.artifact.backend == StoreBackend::Replicated
    }

    /// Look up a cluster by id.
    pub fn cluster(&self, id: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.id == id)
    }
}

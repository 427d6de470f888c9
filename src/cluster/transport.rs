//! Group communication primitive underneath the replication channel.
//!
//! A [`GroupTransport`] lets nodes join a named cluster, see its membership
//! and send messages to individual members. [`LocalGroup`] is the in-process
//! implementation: every node of the cluster lives in the same process and
//! messages are delivered through tokio channels.

use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Cluster member identifier.
pub type NodeId = String;

/// Full contents of a replicated map, used for join-time state transfer.
pub type StateSnapshot = HashMap<String, Vec<u8>>;

/// Messages exchanged between members of a cluster.
#[derive(Debug)]
pub enum GroupMessage {
    /// Apply `key = value`; acknowledge through `ack` when present.
    Update {
        key: String,
        value: Vec<u8>,
        ack: Option<oneshot::Sender<()>>,
    },
    /// Remove `key`; acknowledge through `ack` when present.
    Remove {
        key: String,
        ack: Option<oneshot::Sender<()>>,
    },
    /// Reply with the full local map.
    StateRequest { reply: oneshot::Sender<StateSnapshot> },
    /// Membership changed; `members` is ordered oldest first.
    ViewChanged { members: Vec<NodeId> },
}

/// Inbox through which a member receives group messages.
pub type Inbox = mpsc::UnboundedSender<GroupMessage>;

/// Membership and point-to-point delivery for named clusters.
pub trait GroupTransport: Send + Sync {
    /// Join `cluster` as `node`. Returns the view after joining, oldest first.
    fn join(&self, cluster: &str, node: &NodeId, inbox: Inbox) -> Result<Vec<NodeId>>;

    /// Leave `cluster`. Unknown nodes are ignored.
    fn leave(&self, cluster: &str, node: &NodeId);

    /// Current members of `cluster`, oldest first.
    fn members(&self, cluster: &str) -> Vec<NodeId>;

    /// Deliver `message` to `to`.
    fn send(&self, cluster: &str, to: &NodeId, message: GroupMessage) -> Result<()>;
}

/// In-process group: all members share one registry of inboxes.
#[derive(Default)]
pub struct LocalGroup {
    clusters: RwLock<HashMap<String, Vec<(NodeId, Inbox)>>>,
}

impl LocalGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify_view(members: &[(NodeId, Inbox)]) {
        let view: Vec<NodeId> = members.iter().map(|(id, _)| id.clone()).collect();
        for (_, inbox) in members {
            // A closed inbox belongs to a node that is going away
            let _ = inbox.send(GroupMessage::ViewChanged {
                members: view.clone(),
            });
        }
    }
}

impl GroupTransport for LocalGroup {
    fn join(&self, cluster: &str, node: &NodeId, inbox: Inbox) -> Result<Vec<NodeId>> {
        let mut clusters = self
            .clusters
            .write()
            .map_err(|_| anyhow!("Group registry lock poisoned"))?;
        let members = clusters.entry(cluster.to_string()).or_default();

        if members.iter().any(|(id, _)| id == node) {
            bail!("Node {} is already a member of cluster '{}'", node, cluster);
        }

        members.push((node.clone(), inbox));
        Self::notify_view(members);

        debug!(cluster, node = %node, members = members.len(), "Node joined group");
        Ok(members.iter().map(|(id, _)| id.clone()).collect())
    }

    fn leave(&self, cluster: &str, node: &NodeId) {
        let Ok(mut clusters) = self.clusters.write() else {
            return;
        };
        if let Some(members) = clusters.get_mut(cluster) {
            let before = members.len();
            members.retain(|(id, _)| id != node);
            if members.len() != before {
                Self::notify_view(members);
                debug!(cluster, node = %node, members = members.len(), "Node left group");
            }
        }
    }

    fn members(&self, cluster: &str) -> Vec<NodeId> {
        self.clusters
            .read()
            .ok()
            .and_then(|c| {
                c.get(cluster)
                    .map(|m| m.iter().map(|(id, _)| id.clone()).collect())
            })
            .unwrap_or_default()
    }

    fn send(&self, cluster: &str, to: &NodeId, message: GroupMessage) -> Result<()> {
        let clusters = self
            .clusters
            .read()
            .map_err(|_| anyhow!("Group registry lock poisoned"))?;
        let inbox = clusters
            .get(cluster)
            .and_then(|m| m.iter().find(|(id, _)| id == to))
            .map(|(_, inbox)| inbox)
            .ok_or_else(|| anyhow!("Node {} is not a member of cluster '{}'", to, cluster))?;

        inbox
            .send(message)
            .map_err(|_| anyhow!("Node {} in cluster '{}' is unreachable", to, cluster))
    }
}

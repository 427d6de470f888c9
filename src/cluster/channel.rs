//! Replicated map shared by the members of one cluster.
//!
//! Each node holds a full copy of the map. Writes apply locally first and are
//! then pushed to every other member; with `blocking_updates` the write waits
//! for all peers to acknowledge within `update_timeout`. Conflicts resolve as
//! last-write-wins per key.
//!
//! A joining node applies peer messages as soon as it has joined, before the
//! state snapshot arrives. Keys updated or removed in that window are never
//! overwritten by the snapshot, which may predate them.

use anyhow::{anyhow, Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{GroupMessage, GroupTransport, NodeId, StateSnapshot};
use crate::config::ClusterConfig;

/// How the join-time state transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransfer {
    /// First member of the cluster; nothing to fetch.
    NotNeeded,
    /// Received this many entries from the coordinator.
    Complete(usize),
    /// No reply within `state_transfer_timeout`; started empty.
    TimedOut,
    /// Coordinator unreachable; started empty.
    Failed,
}

/// Local copy of a replicated map.
#[derive(Default)]
struct Replica {
    entries: StateSnapshot,
    /// Keys written while the state transfer is outstanding; `None` after it.
    touched: Option<HashSet<String>>,
}

impl Replica {
    fn joining() -> Self {
        Self {
            entries: HashMap::new(),
            touched: Some(HashSet::new()),
        }
    }

    fn update(&mut self, key: String, value: Vec<u8>) {
        if let Some(touched) = self.touched.as_mut() {
            touched.insert(key.clone());
        }
        self.entries.insert(key, value);
    }

    fn remove(&mut self, key: &str) -> bool {
        if let Some(touched) = self.touched.as_mut() {
            touched.insert(key.to_string());
        }
        self.entries.remove(key).is_some()
    }

    /// Apply a state snapshot underneath the writes already received.
    fn install(&mut self, snapshot: StateSnapshot) {
        let touched = self.touched.take().unwrap_or_default();
        for (key, value) in snapshot {
            if !touched.contains(&key) {
                self.entries.insert(key, value);
            }
        }
    }

    fn finish_transfer(&mut self) {
        self.touched = None;
    }
}

/// One node's handle on a replicated map.
pub struct ReplicationChannel {
    config: ClusterConfig,
    node: NodeId,
    transport: Arc<dyn GroupTransport>,
    map: Arc<RwLock<Replica>>,
    state_transfer: StateTransfer,
    listener: JoinHandle<()>,
}

impl ReplicationChannel {
    /// Join the cluster named by `config.id` and fetch the current state.
    ///
    /// A slow or unreachable coordinator never blocks startup beyond
    /// `state_transfer_timeout`; the node then starts with an empty map.
    pub async fn connect(transport: Arc<dyn GroupTransport>, config: ClusterConfig) -> Result<Self> {
        let node: NodeId = uuid::Uuid::new_v4().to_string();
        let (inbox, rx) = mpsc::unbounded_channel();
        let map = Arc::new(RwLock::new(Replica::joining()));

        let view = transport
            .join(&config.id, &node, inbox)
            .with_context(|| format!("Failed to join cluster '{}'", config.id))?;

        let listener = tokio::spawn(listen(
            config.id.clone(),
            node.clone(),
            rx,
            Arc::clone(&map),
        ));

        let mut channel = Self {
            config,
            node,
            transport,
            map,
            state_transfer: StateTransfer::NotNeeded,
            listener,
        };
        channel.state_transfer = channel.fetch_state(&view).await;
        if let Ok(mut replica) = channel.map.write() {
            replica.finish_transfer();
        }

        info!(
            cluster = %channel.config.id,
            node = %channel.node,
            members = view.len(),
            blocking_updates = channel.config.blocking_updates,
            state_transfer = ?channel.state_transfer,
            "Joined replication cluster"
        );

        Ok(channel)
    }

    async fn fetch_state(&self, view: &[NodeId]) -> StateTransfer {
        let Some(coordinator) = view.iter().find(|id| **id != self.node) else {
            return StateTransfer::NotNeeded;
        };

        let (reply, reply_rx) = oneshot::channel();
        if let Err(e) = self.transport.send(
            &self.config.id,
            coordinator,
            GroupMessage::StateRequest { reply },
        ) {
            warn!(cluster = %self.config.id, error = %e, "State transfer request failed, starting empty");
            return StateTransfer::Failed;
        }

        let timeout = self.config.state_transfer_timeout();
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(snapshot)) => {
                let count = snapshot.len();
                if let Ok(mut replica) = self.map.write() {
                    replica.install(snapshot);
                }
                StateTransfer::Complete(count)
            }
            Ok(Err(_)) => {
                warn!(cluster = %self.config.id, coordinator = %coordinator, "Coordinator dropped state transfer, starting empty");
                StateTransfer::Failed
            }
            Err(_) => {
                warn!(
                    cluster = %self.config.id,
                    coordinator = %coordinator,
                    timeout_ms = timeout.as_millis() as u64,
                    "State transfer timed out, starting empty"
                );
                StateTransfer::TimedOut
            }
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.config.id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn state_transfer(&self) -> StateTransfer {
        self.state_transfer
    }

    /// Current members, oldest first.
    pub fn members(&self) -> Vec<NodeId> {
        self.transport.members(&self.config.id)
    }

    /// Store `value` under `key` and replicate it.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        {
            let mut map = self.map.write().map_err(|_| self.lock_err())?;
            map.update(key.to_string(), value.clone());
        }

        self.replicate(key, |ack| GroupMessage::Update {
            key: key.to_string(),
            value: value.clone(),
            ack,
        })
        .await
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.map.read().map_err(|_| self.lock_err())?;
        Ok(map.entries.get(key).cloned())
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        let map = self.map.read().map_err(|_| self.lock_err())?;
        Ok(map.entries.contains_key(key))
    }

    /// Remove `key` locally and on every member.
    ///
    /// Returns whether the key was present locally.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let removed = {
            let mut map = self.map.write().map_err(|_| self.lock_err())?;
            map.remove(key)
        };

        self.replicate(key, |ack| GroupMessage::Remove {
            key: key.to_string(),
            ack,
        })
        .await?;

        Ok(removed)
    }

    pub fn size(&self) -> Result<usize> {
        let map = self.map.read().map_err(|_| self.lock_err())?;
        Ok(map.entries.len())
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let map = self.map.read().map_err(|_| self.lock_err())?;
        Ok(map.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Leave the cluster. Entries written by this node stay on the others.
    pub fn leave(&self) {
        self.transport.leave(&self.config.id, &self.node);
        self.listener.abort();
        debug!(cluster = %self.config.id, node = %self.node, "Left replication cluster");
    }

    async fn replicate<F>(&self, key: &str, message: F) -> Result<()>
    where
        F: Fn(Option<oneshot::Sender<()>>) -> GroupMessage,
    {
        let peers: Vec<NodeId> = self
            .members()
            .into_iter()
            .filter(|id| *id != self.node)
            .collect();
        if peers.is_empty() {
            return Ok(());
        }

        if !self.config.blocking_updates {
            for peer in &peers {
                if let Err(e) = self.transport.send(&self.config.id, peer, message(None)) {
                    debug!(cluster = %self.config.id, key, error = %e, "Async replication skipped a peer");
                }
            }
            return Ok(());
        }

        let mut acks = Vec::with_capacity(peers.len());
        for peer in &peers {
            let (ack, ack_rx) = oneshot::channel();
            self.transport
                .send(&self.config.id, peer, message(Some(ack)))
                .with_context(|| format!("Failed to replicate '{}' in cluster '{}'", key, self.config.id))?;
            acks.push((peer, ack_rx));
        }

        let timeout = self.config.update_timeout();
        let wait_all = async {
            for (peer, ack_rx) in acks {
                ack_rx.await.map_err(|_| {
                    anyhow!("Node {} dropped update of '{}' in cluster '{}'", peer, key, self.config.id)
                })?;
            }
            Ok::<(), anyhow::Error>(())
        };

        match tokio::time::timeout(timeout, wait_all).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "Replication of '{}' in cluster '{}' timed out after {}ms",
                key,
                self.config.id,
                timeout.as_millis()
            )),
        }
    }

    fn lock_err(&self) -> anyhow::Error {
        anyhow!("Replicated map '{}' lock poisoned", self.config.id)
    }
}

impl Drop for ReplicationChannel {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Apply messages from other members to the local map.
async fn listen(
    cluster: String,
    node: NodeId,
    mut rx: mpsc::UnboundedReceiver<GroupMessage>,
    map: Arc<RwLock<Replica>>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            GroupMessage::Update { key, value, ack } => {
                let applied = match map.write() {
                    Ok(mut m) => {
                        m.update(key, value);
                        true
                    }
                    Err(_) => false,
                };
                if let (true, Some(ack)) = (applied, ack) {
                    let _ = ack.send(());
                }
            }
            GroupMessage::Remove { key, ack } => {
                let applied = match map.write() {
                    Ok(mut m) => {
                        m.remove(&key);
                        true
                    }
                    Err(_) => false,
                };
                if let (true, Some(ack)) = (applied, ack) {
                    let _ = ack.send(());
                }
            }
            GroupMessage::StateRequest { reply } => {
                let snapshot = match map.read() {
                    Ok(m) => m.entries.clone(),
                    Err(_) => continue,
                };
                let _ = reply.send(snapshot);
            }
            GroupMessage::ViewChanged { members } => {
                info!(cluster = %cluster, node = %node, members = members.len(), "Cluster view changed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::transport::LocalGroup;
    use std::time::Duration;

    fn config(blocking: bool) -> ClusterConfig {
        ClusterConfig {
            id: "test-cluster".to_string(),
            blocking_updates: blocking,
            update_timeout_ms: 200,
            state_transfer_timeout_ms: 200,
        }
    }

    /// Join a member that never reads its inbox.
    fn join_silent_member(group: &LocalGroup) -> mpsc::UnboundedReceiver<GroupMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        group
            .join("test-cluster", &"silent".to_string(), tx)
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_blocking_put_visible_on_peer() {
        let group: Arc<dyn GroupTransport> = Arc::new(LocalGroup::new());
        let a = ReplicationChannel::connect(group.clone(), config(true)).await.unwrap();
        let b = ReplicationChannel::connect(group.clone(), config(true)).await.unwrap();

        a.put("k", b"v".to_vec()).await.unwrap();

        // Acknowledged means applied on b
        assert_eq!(b.get("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(a.members().len(), 2);
    }

    #[tokio::test]
    async fn test_async_put_propagates() {
        let group: Arc<dyn GroupTransport> = Arc::new(LocalGroup::new());
        let a = ReplicationChannel::connect(group.clone(), config(false)).await.unwrap();
        let b = ReplicationChannel::connect(group.clone(), config(false)).await.unwrap();

        a.put("k", b"v".to_vec()).await.unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if b.contains("k").unwrap() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(seen);
    }

    #[tokio::test]
    async fn test_blocking_put_fails_on_unresponsive_peer() {
        let local = Arc::new(LocalGroup::new());
        let group: Arc<dyn GroupTransport> = local.clone();
        let a = ReplicationChannel::connect(group.clone(), config(true)).await.unwrap();
        let _silent = join_silent_member(&local);

        let err = a.put("k", b"v".to_vec()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));

        // The local write still applied
        assert!(a.contains("k").unwrap());
    }

    #[tokio::test]
    async fn test_state_transfer_on_join() {
        let group: Arc<dyn GroupTransport> = Arc::new(LocalGroup::new());
        let a = ReplicationChannel::connect(group.clone(), config(true)).await.unwrap();
        a.put("one", b"1".to_vec()).await.unwrap();
        a.put("two", b"2".to_vec()).await.unwrap();

        let b = ReplicationChannel::connect(group.clone(), config(true)).await.unwrap();
        assert_eq!(a.state_transfer(), StateTransfer::NotNeeded);
        assert_eq!(b.state_transfer(), StateTransfer::Complete(2));
        assert_eq!(b.size().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_state_transfer_timeout_starts_empty() {
        let local = Arc::new(LocalGroup::new());
        let _silent = join_silent_member(&local);

        let group: Arc<dyn GroupTransport> = local.clone();
        let a = ReplicationChannel::connect(group, config(true)).await.unwrap();

        assert_eq!(a.state_transfer(), StateTransfer::TimedOut);
        assert_eq!(a.size().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_departure_keeps_entries() {
        let group: Arc<dyn GroupTransport> = Arc::new(LocalGroup::new());
        let a = ReplicationChannel::connect(group.clone(), config(true)).await.unwrap();
        let b = ReplicationChannel::connect(group.clone(), config(true)).await.unwrap();

        b.put("from-b", b"x".to_vec()).await.unwrap();
        drop(b);

        assert_eq!(a.members().len(), 1);
        assert_eq!(a.get("from-b").unwrap(), Some(b"x".to_vec()));
    }

    /// Held state-transfer reply: the coordinator's snapshot and the joiner's reply slot.
    type HeldReply = (oneshot::Receiver<StateSnapshot>, oneshot::Sender<StateSnapshot>);

    /// Transport that intercepts state requests so a test decides when the
    /// joining node receives its snapshot.
    struct HeldTransfer {
        inner: LocalGroup,
        held: mpsc::UnboundedSender<HeldReply>,
    }

    impl HeldTransfer {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HeldReply>) {
            let (held, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                inner: LocalGroup::new(),
                held,
            });
            (transport, rx)
        }
    }

    impl GroupTransport for HeldTransfer {
        fn join(&self, cluster: &str, node: &NodeId, inbox: crate::cluster::transport::Inbox) -> Result<Vec<NodeId>> {
            self.inner.join(cluster, node, inbox)
        }

        fn leave(&self, cluster: &str, node: &NodeId) {
            self.inner.leave(cluster, node)
        }

        fn members(&self, cluster: &str) -> Vec<NodeId> {
            self.inner.members(cluster)
        }

        fn send(&self, cluster: &str, to: &NodeId, message: GroupMessage) -> Result<()> {
            match message {
                GroupMessage::StateRequest { reply } => {
                    let (snapshot_tx, snapshot_rx) = oneshot::channel();
                    self.inner
                        .send(cluster, to, GroupMessage::StateRequest { reply: snapshot_tx })?;
                    self.held
                        .send((snapshot_rx, reply))
                        .map_err(|_| anyhow!("held reply queue closed"))
                }
                other => self.inner.send(cluster, to, other),
            }
        }
    }

    fn slow_join_config() -> ClusterConfig {
        ClusterConfig {
            state_transfer_timeout_ms: 5_000,
            ..config(true)
        }
    }

    #[tokio::test]
    async fn test_writes_during_state_transfer_win_over_snapshot() {
        let (held, mut replies) = HeldTransfer::new();
        let group: Arc<dyn GroupTransport> = held;

        let a = ReplicationChannel::connect(group.clone(), slow_join_config()).await.unwrap();
        a.put("artifact-x", b"payload".to_vec()).await.unwrap();
        a.put("ticket-y", b"old".to_vec()).await.unwrap();

        let joining = tokio::spawn(ReplicationChannel::connect(group.clone(), slow_join_config()));

        // The coordinator has taken its snapshot; the joiner has not seen it yet
        let (snapshot_rx, reply) = replies.recv().await.unwrap();
        let snapshot = snapshot_rx.await.unwrap();
        assert!(snapshot.contains_key("artifact-x"));

        // Both writes are acknowledged by the joining node
        assert!(a.remove("artifact-x").await.unwrap());
        a.put("ticket-y", b"new".to_vec()).await.unwrap();

        reply.send(snapshot).unwrap();
        let b = joining.await.unwrap().unwrap();

        assert_eq!(b.state_transfer(), StateTransfer::Complete(2));
        assert_eq!(a.get("artifact-x").unwrap(), None);
        assert_eq!(b.get("artifact-x").unwrap(), None);
        assert_eq!(b.get("ticket-y").unwrap(), Some(b"new".to_vec()));
        assert_eq!(b.size().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_cluster_wide() {
        let group: Arc<dyn GroupTransport> = Arc::new(LocalGroup::new());
        let a = ReplicationChannel::connect(group.clone(), config(true)).await.unwrap();
        let b = ReplicationChannel::connect(group.clone(), config(true)).await.unwrap();

        a.put("k", b"v".to_vec()).await.unwrap();
        assert!(b.remove("k").await.unwrap());

        assert!(!a.contains("k").unwrap());
        assert!(!b.remove("k").await.unwrap());
    }
}

//! Cluster transport over TCP, linking broker processes.
//!
//! Each process listens on `network.listen` and dials every configured peer.
//! Frames go out on dialed connections and come in on accepted ones; a frame
//! is a big-endian `u32` length followed by a MessagePack body.
//!
//! Membership is learned from the peers themselves: a process announces its
//! local members when it connects and on every join or leave, and forgets a
//! peer's members when that peer's connection drops. Views are ordered by
//! join time, so every process agrees on the oldest member up to clock skew.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::transport::{GroupMessage, GroupTransport, Inbox, NodeId, StateSnapshot};
use crate::config::NetworkConfig;

/// Largest frame accepted; full state snapshots are the big ones.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Name of a broker process on the cluster network.
pub type PeerId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Membership {
    cluster: String,
    node: NodeId,
    /// Milliseconds since the epoch.
    joined_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Frame {
    Hello {
        peer: PeerId,
        members: Vec<Membership>,
    },
    Joined(Membership),
    Left {
        cluster: String,
        node: NodeId,
    },
    Update {
        cluster: String,
        to: NodeId,
        key: String,
        value: Vec<u8>,
        ack: Option<u64>,
    },
    Remove {
        cluster: String,
        to: NodeId,
        key: String,
        ack: Option<u64>,
    },
    StateRequest {
        cluster: String,
        to: NodeId,
        request: u64,
    },
    StateReply {
        request: u64,
        snapshot: StateSnapshot,
    },
    Ack {
        request: u64,
    },
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let body = rmp_serde::to_vec_named(frame).context("Failed to encode cluster frame")?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| anyhow!("Cluster frame of {} bytes exceeds the limit", body.len()))?;

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Returns `None` when the stream ends between frames.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        bail!("Cluster frame of {} bytes exceeds the limit", len);
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    rmp_serde::from_slice(&body)
        .map(Some)
        .context("Failed to decode cluster frame")
}

struct LocalMember {
    node: NodeId,
    inbox: Inbox,
    joined_at: i64,
}

struct RemoteMember {
    peer: PeerId,
    node: NodeId,
    joined_at: i64,
}

/// Reply slot waiting for a peer's answer.
enum Pending {
    Ack(oneshot::Sender<()>),
    State(oneshot::Sender<StateSnapshot>),
}

impl Pending {
    fn is_closed(&self) -> bool {
        match self {
            Pending::Ack(tx) => tx.is_closed(),
            Pending::State(tx) => tx.is_closed(),
        }
    }
}

#[derive(Default)]
struct State {
    local: HashMap<String, Vec<LocalMember>>,
    remote: HashMap<String, Vec<RemoteMember>>,
    /// Accepted connection currently carrying each peer's frames.
    connections: HashMap<PeerId, u64>,
    pending: HashMap<u64, (PeerId, Pending)>,
}

impl State {
    fn view(&self, cluster: &str) -> Vec<NodeId> {
        let mut members: Vec<(i64, &NodeId)> = Vec::new();
        if let Some(local) = self.local.get(cluster) {
            members.extend(local.iter().map(|m| (m.joined_at, &m.node)));
        }
        if let Some(remote) = self.remote.get(cluster) {
            members.extend(remote.iter().map(|m| (m.joined_at, &m.node)));
        }
        members.sort();
        members.into_iter().map(|(_, node)| node.clone()).collect()
    }

    fn notify_view(&self, cluster: &str) {
        let Some(local) = self.local.get(cluster) else {
            return;
        };
        let view = self.view(cluster);
        for member in local {
            let _ = member.inbox.send(GroupMessage::ViewChanged {
                members: view.clone(),
            });
        }
    }

    fn add_remote(&mut self, peer: &PeerId, membership: Membership) {
        let members = self.remote.entry(membership.cluster.clone()).or_default();
        members.retain(|m| m.node != membership.node);
        members.push(RemoteMember {
            peer: peer.clone(),
            node: membership.node,
            joined_at: membership.joined_at,
        });
        self.notify_view(&membership.cluster);
    }

    /// Forget every member hosted by `peer`.
    fn drop_peer_members(&mut self, peer: &PeerId) {
        let mut affected = HashSet::new();
        for (cluster, members) in self.remote.iter_mut() {
            let before = members.len();
            members.retain(|m| &m.peer != peer);
            if members.len() != before {
                affected.insert(cluster.clone());
            }
        }
        for cluster in affected {
            self.notify_view(&cluster);
        }
    }

    fn local_inbox(&self, cluster: &str, node: &NodeId) -> Option<&Inbox> {
        self.local
            .get(cluster)?
            .iter()
            .find(|m| &m.node == node)
            .map(|m| &m.inbox)
    }

    fn memberships(&self) -> Vec<Membership> {
        self.local
            .iter()
            .flat_map(|(cluster, members)| {
                members.iter().map(move |m| Membership {
                    cluster: cluster.clone(),
                    node: m.node.clone(),
                    joined_at: m.joined_at,
                })
            })
            .collect()
    }
}

struct Shared {
    me: PeerId,
    outbound: HashMap<PeerId, mpsc::UnboundedSender<Frame>>,
    state: RwLock<State>,
    next_request: AtomicU64,
    connected: Notify,
}

impl Shared {
    fn lock_err() -> anyhow::Error {
        anyhow!("Cluster transport state lock poisoned")
    }

    fn push(&self, peer: &PeerId, frame: Frame) -> Result<()> {
        let queue = self
            .outbound
            .get(peer)
            .ok_or_else(|| anyhow!("Unknown cluster peer {}", peer))?;
        queue
            .send(frame)
            .map_err(|_| anyhow!("Connection to cluster peer {} is closed", peer))
    }

    fn broadcast(&self, frame: Frame) {
        for peer in self.outbound.keys() {
            if let Err(e) = self.push(peer, frame.clone()) {
                debug!(peer = %peer, error = %e, "Membership announcement skipped a peer");
            }
        }
    }

    fn register(&self, peer: &PeerId, pending: Pending) -> Result<u64> {
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().map_err(|_| Self::lock_err())?;
        // Callers that gave up leave closed slots behind
        state.pending.retain(|_, (_, p)| !p.is_closed());
        state.pending.insert(request, (peer.clone(), pending));
        Ok(request)
    }

    fn complete(&self, request: u64) -> Option<Pending> {
        let mut state = self.state.write().ok()?;
        state.pending.remove(&request).map(|(_, pending)| pending)
    }

    fn connected_peers(&self) -> usize {
        self.state.read().map(|s| s.connections.len()).unwrap_or(0)
    }

    fn hello(&self, peer: &PeerId, conn: u64, members: Vec<Membership>) {
        if let Ok(mut state) = self.state.write() {
            state.connections.insert(peer.clone(), conn);
            state.drop_peer_members(peer);
            for membership in members {
                state.add_remote(peer, membership);
            }
        }
        self.connected.notify_waiters();
    }

    fn disconnected(&self, peer: &PeerId, conn: u64) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        // A newer connection from the same peer supersedes this one
        if state.connections.get(peer) != Some(&conn) {
            return;
        }
        state.connections.remove(peer);
        state.drop_peer_members(peer);
        // Waiting callers see the dropped slot at once instead of timing out
        state.pending.retain(|_, (owner, _)| owner.as_str() != peer.as_str());
    }

    /// Ack slot whose completion is sent back to `peer` as `Frame::Ack`.
    fn forward_ack(self: &Arc<Self>, peer: &PeerId, request: u64) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(self);
        let peer = peer.clone();
        tokio::spawn(async move {
            if rx.await.is_ok() {
                let _ = shared.push(&peer, Frame::Ack { request });
            }
        });
        tx
    }

    fn deliver(&self, cluster: &str, to: &NodeId, message: GroupMessage) {
        let delivered = self
            .state
            .read()
            .ok()
            .and_then(|state| state.local_inbox(cluster, to).map(|inbox| inbox.send(message).is_ok()))
            .unwrap_or(false);
        if !delivered {
            debug!(cluster, node = %to, "Dropped cluster frame for a node that is not here");
        }
    }

    fn handle(self: &Arc<Self>, peer: &PeerId, frame: Frame) {
        match frame {
            Frame::Hello { .. } => {
                warn!(peer = %peer, "Unexpected repeated hello from cluster peer");
            }
            Frame::Joined(membership) => {
                if let Ok(mut state) = self.state.write() {
                    state.add_remote(peer, membership);
                }
            }
            Frame::Left { cluster, node } => {
                if let Ok(mut state) = self.state.write() {
                    if let Some(members) = state.remote.get_mut(&cluster) {
                        members.retain(|m| m.node != node);
                    }
                    state.notify_view(&cluster);
                }
            }
            Frame::Update {
                cluster,
                to,
                key,
                value,
                ack,
            } => {
                let ack = ack.map(|request| self.forward_ack(peer, request));
                self.deliver(&cluster, &to, GroupMessage::Update { key, value, ack });
            }
            Frame::Remove {
                cluster,
                to,
                key,
                ack,
            } => {
                let ack = ack.map(|request| self.forward_ack(peer, request));
                self.deliver(&cluster, &to, GroupMessage::Remove { key, ack });
            }
            Frame::StateRequest {
                cluster,
                to,
                request,
            } => {
                let (reply, snapshot_rx) = oneshot::channel();
                let shared = Arc::clone(self);
                let peer = peer.clone();
                tokio::spawn(async move {
                    if let Ok(snapshot) = snapshot_rx.await {
                        let _ = shared.push(&peer, Frame::StateReply { request, snapshot });
                    }
                });
                self.deliver(&cluster, &to, GroupMessage::StateRequest { reply });
            }
            Frame::StateReply { request, snapshot } => {
                if let Some(Pending::State(tx)) = self.complete(request) {
                    let _ = tx.send(snapshot);
                }
            }
            Frame::Ack { request } => {
                if let Some(Pending::Ack(tx)) = self.complete(request) {
                    let _ = tx.send(());
                }
            }
        }
    }
}

/// Keep a connection to `peer` open and feed it the peer's outbound queue.
async fn dial(
    shared: Arc<Shared>,
    peer: PeerId,
    addr: SocketAddr,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    retry: Duration,
) {
    loop {
        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(peer = %peer, addr = %addr, error = %e, "Cluster peer not reachable");
                tokio::time::sleep(retry).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let members = match shared.state.read() {
            Ok(state) => state.memberships(),
            Err(_) => return,
        };
        let hello = Frame::Hello {
            peer: shared.me.clone(),
            members,
        };

        match write_frame(&mut stream, &hello).await {
            Ok(()) => info!(peer = %peer, addr = %addr, "Connected to cluster peer"),
            Err(e) => {
                warn!(peer = %peer, addr = %addr, error = %e, "Cluster handshake failed");
                tokio::time::sleep(retry).await;
                continue;
            }
        }

        loop {
            let Some(frame) = queue.recv().await else {
                return;
            };
            if let Err(e) = write_frame(&mut stream, &frame).await {
                warn!(peer = %peer, addr = %addr, error = %e, "Lost connection to cluster peer");
                break;
            }
        }
        tokio::time::sleep(retry).await;
    }
}

/// Read frames from one accepted connection until it closes.
async fn receive(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr, conn: u64) {
    let peer = match read_frame(&mut stream).await {
        Ok(Some(Frame::Hello { peer, members })) if shared.outbound.contains_key(&peer) => {
            shared.hello(&peer, conn, members);
            peer
        }
        Ok(Some(Frame::Hello { peer, .. })) => {
            warn!(peer = %peer, addr = %addr, "Rejected connection from unconfigured cluster peer");
            return;
        }
        Ok(Some(_)) => {
            warn!(addr = %addr, "Cluster connection did not start with a hello");
            return;
        }
        Ok(None) => return,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Cluster handshake failed");
            return;
        }
    };
    debug!(peer = %peer, addr = %addr, "Accepted cluster peer connection");

    loop {
        match read_frame(&mut stream).await {
            Ok(Some(frame)) => shared.handle(&peer, frame),
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Cluster connection failed");
                break;
            }
        }
    }

    shared.disconnected(&peer, conn);
    info!(peer = %peer, "Cluster peer disconnected");
}

async fn accept(shared: Arc<Shared>, listener: TcpListener) {
    let mut receivers = JoinSet::new();
    let mut next_conn: u64 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    next_conn += 1;
                    receivers.spawn(receive(Arc::clone(&shared), stream, addr, next_conn));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept cluster connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = receivers.join_next(), if !receivers.is_empty() => {}
        }
    }
}

/// [`GroupTransport`] spanning broker processes over TCP.
pub struct TcpGroup {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpGroup {
    /// Bind `config.listen` and connect to the configured peers.
    pub async fn start(config: NetworkConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("Failed to bind cluster listener on {}", config.listen))?;
        Self::serve(listener, config).await
    }

    /// Run on an already bound listener.
    ///
    /// Waits up to `discovery_timeout` for every peer to connect, so that
    /// clusters joined right after startup see the members already running.
    pub async fn serve(listener: TcpListener, config: NetworkConfig) -> Result<Self> {
        let local_addr = listener
            .local_addr()
            .context("Cluster listener has no local address")?;

        let mut outbound = HashMap::new();
        let mut queues = Vec::new();
        for peer in &config.peers {
            let (tx, rx) = mpsc::unbounded_channel();
            outbound.insert(peer.id.clone(), tx);
            queues.push((peer.id.clone(), peer.addr, rx));
        }

        let shared = Arc::new(Shared {
            me: config.node_id.clone(),
            outbound,
            state: RwLock::new(State::default()),
            next_request: AtomicU64::new(1),
            connected: Notify::new(),
        });

        let mut tasks = vec![tokio::spawn(accept(Arc::clone(&shared), listener))];
        for (peer, addr, queue) in queues {
            tasks.push(tokio::spawn(dial(
                Arc::clone(&shared),
                peer,
                addr,
                queue,
                config.reconnect_interval(),
            )));
        }

        let group = Self {
            shared,
            local_addr,
            tasks,
        };
        group.await_peers(config.discovery_timeout()).await;

        info!(
            node = %config.node_id,
            listen = %local_addr,
            peers = config.peers.len(),
            connected = group.connected_peers(),
            "Cluster transport started"
        );
        Ok(group)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peers with a live connection into this process.
    pub fn connected_peers(&self) -> usize {
        self.shared.connected_peers()
    }

    async fn await_peers(&self, timeout: Duration) {
        let expected = self.shared.outbound.len();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.connected.notified();
            if self.connected_peers() >= expected {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    connected = self.connected_peers(),
                    expected,
                    "Not every cluster peer connected before the discovery timeout"
                );
                return;
            }
        }
    }
}

impl Drop for TcpGroup {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl GroupTransport for TcpGroup {
    fn join(&self, cluster: &str, node: &NodeId, inbox: Inbox) -> Result<Vec<NodeId>> {
        let joined_at = Utc::now().timestamp_millis();
        let view = {
            let mut state = self.shared.state.write().map_err(|_| Shared::lock_err())?;
            let members = state.local.entry(cluster.to_string()).or_default();
            if members.iter().any(|m| &m.node == node) {
                bail!("Node {} is already a member of cluster '{}'", node, cluster);
            }
            members.push(LocalMember {
                node: node.clone(),
                inbox,
                joined_at,
            });
            state.notify_view(cluster);
            state.view(cluster)
        };

        self.shared.broadcast(Frame::Joined(Membership {
            cluster: cluster.to_string(),
            node: node.clone(),
            joined_at,
        }));
        debug!(cluster, node = %node, members = view.len(), "Node joined networked group");
        Ok(view)
    }

    fn leave(&self, cluster: &str, node: &NodeId) {
        let left = match self.shared.state.write() {
            Ok(mut state) => {
                let removed = state.local.get_mut(cluster).is_some_and(|members| {
                    let before = members.len();
                    members.retain(|m| &m.node != node);
                    members.len() != before
                });
                if removed {
                    state.notify_view(cluster);
                }
                removed
            }
            Err(_) => false,
        };

        if left {
            self.shared.broadcast(Frame::Left {
                cluster: cluster.to_string(),
                node: node.clone(),
            });
            debug!(cluster, node = %node, "Node left networked group");
        }
    }

    fn members(&self, cluster: &str) -> Vec<NodeId> {
        self.shared
            .state
            .read()
            .map(|state| state.view(cluster))
            .unwrap_or_default()
    }

    fn send(&self, cluster: &str, to: &NodeId, message: GroupMessage) -> Result<()> {
        let peer = {
            let state = self.shared.state.read().map_err(|_| Shared::lock_err())?;
            if let Some(inbox) = state.local_inbox(cluster, to) {
                return inbox
                    .send(message)
                    .map_err(|_| anyhow!("Node {} in cluster '{}' is unreachable", to, cluster));
            }
            state
                .remote
                .get(cluster)
                .and_then(|members| members.iter().find(|m| &m.node == to))
                .map(|m| m.peer.clone())
                .ok_or_else(|| anyhow!("Node {} is not a member of cluster '{}'", to, cluster))?
        };

        let frame = match message {
            GroupMessage::Update { key, value, ack } => Frame::Update {
                cluster: cluster.to_string(),
                to: to.clone(),
                key,
                value,
                ack: match ack {
                    Some(tx) => Some(self.shared.register(&peer, Pending::Ack(tx))?),
                    None => None,
                },
            },
            GroupMessage::Remove { key, ack } => Frame::Remove {
                cluster: cluster.to_string(),
                to: to.clone(),
                key,
                ack: match ack {
                    Some(tx) => Some(self.shared.register(&peer, Pending::Ack(tx))?),
                    None => None,
                },
            },
            GroupMessage::StateRequest { reply } => Frame::StateRequest {
                cluster: cluster.to_string(),
                to: to.clone(),
                request: self.shared.register(&peer, Pending::State(reply))?,
            },
            // Every process derives views from its own membership table
            GroupMessage::ViewChanged { .. } => return Ok(()),
        };

        self.shared.push(&peer, frame)
    }
}

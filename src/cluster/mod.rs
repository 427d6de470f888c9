//! Cluster replication.
//!
//! Nodes sharing a cluster name keep a full copy of one replicated map. The
//! [`ChannelRegistry`] owns one channel per configured cluster, and
//! [`ReplicatedStore`] exposes a channel as an expiring store. Nodes talk
//! through a [`GroupTransport`]: [`LocalGroup`] inside one process, or
//! [`TcpGroup`] between broker processes.

pub mod channel;
pub mod registry;
pub mod store;
pub mod tcp;
pub mod transport;

pub use channel::{ReplicationChannel, StateTransfer};
pub use registry::ChannelRegistry;
pub use store::ReplicatedStore;
pub use tcp::TcpGroup;
pub use transport::{GroupMessage, GroupTransport, LocalGroup, NodeId};

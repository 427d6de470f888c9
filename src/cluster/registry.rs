//! Cluster name to channel mapping, built once at startup.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;

use super::channel::ReplicationChannel;
use super::transport::GroupTransport;
use crate::config::ClusterConfig;

/// Owns one [`ReplicationChannel`] per configured cluster.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<ReplicationChannel>>,
}

impl ChannelRegistry {
    /// Connect to every configured cluster.
    pub async fn build(transport: Arc<dyn GroupTransport>, clusters: &[ClusterConfig]) -> Result<Self> {
        let mut channels = HashMap::new();
        for config in clusters {
            if channels.contains_key(&config.id) {
                bail!("Cluster '{}' configured more than once", config.id);
            }
            let channel = ReplicationChannel::connect(Arc::clone(&transport), config.clone()).await?;
            channels.insert(config.id.clone(), Arc::new(channel));
        }
        Ok(Self { channels })
    }

    pub fn get(&self, cluster_id: &str) -> Option<Arc<ReplicationChannel>> {
        self.channels.get(cluster_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Leave every cluster.
    pub fn shutdown(&self) {
        for channel in self.channels.values() {
            channel.leave();
        }
    }
}

//! Open channels to neighbouring sessions and next-hop resolution

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use overlink_core::{ChannelHandle, ChannelId, InstanceNodeSessionId, RpcError, RpcResult};
use overlink_routing::TopologyService;
use overlink_rpc::{RpcMessage, RpcRouter};

use crate::message::NodeMessage;

/// Every channel the node currently has, across all transports
#[derive(Default)]
pub struct NeighbourTable {
    channels: DashMap<ChannelId, ChannelHandle>,
}

impl NeighbourTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, channel: ChannelHandle) {
        self.channels.insert(channel.channel_id().clone(), channel);
    }

    pub fn remove(&self, channel_id: &ChannelId) -> Option<ChannelHandle> {
        self.channels.remove(channel_id).map(|(_, channel)| channel)
    }

    /// An established channel to `neighbour`
    ///
    /// With several parallel channels the one with the smallest id is used,
    /// so all traffic to a neighbour sticks to one channel.
    pub fn channel_to(&self, neighbour: &InstanceNodeSessionId) -> Option<ChannelHandle> {
        self.channels
            .iter()
            .filter(|entry| {
                entry.value().remote_node_id() == neighbour && entry.value().is_established()
            })
            .min_by(|a, b| a.key().cmp(b.key()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All channels except `except`
    pub fn all_except(&self, except: Option<&ChannelId>) -> Vec<ChannelHandle> {
        self.channels
            .iter()
            .filter(|entry| Some(entry.key()) != except)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Sessions with at least one established channel
    pub fn neighbours(&self) -> BTreeSet<InstanceNodeSessionId> {
        self.channels
            .iter()
            .filter(|entry| entry.value().is_established())
            .map(|entry| entry.value().remote_node_id().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Routes RPC messages over the neighbour channel chosen by the topology
pub struct ChannelRouteResolver {
    topology: Arc<TopologyService>,
    neighbours: Arc<NeighbourTable>,
}

impl ChannelRouteResolver {
    pub fn new(topology: Arc<TopologyService>, neighbours: Arc<NeighbourTable>) -> Self {
        Self {
            topology,
            neighbours,
        }
    }
}

#[async_trait]
impl RpcRouter for ChannelRouteResolver {
    async fn send_toward(&self, target: &InstanceNodeSessionId, message: RpcMessage) -> RpcResult<()> {
        let hop = self
            .topology
            .next_hop(target)
            .map_err(|_| RpcError::NoRoute(target.to_string()))?;
        // The topology may still list a link whose channel is already closing
        let channel = self
            .neighbours
            .channel_to(&hop)
            .ok_or_else(|| RpcError::NoRoute(target.to_string()))?;

        let payload = NodeMessage::Rpc(message)
            .encode()
            .map_err(|e| RpcError::Serialization(e.to_string()))?;
        trace!(channel = %channel.channel_id(), bytes = payload.len(), "Sending RPC message");
        channel
            .send(payload)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))
    }
}

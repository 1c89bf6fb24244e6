//! Channel events of all transports, as seen by the node
//!
//! A new channel becomes a topology link and both sides exchange their full
//! advertisement batch over it. Advertisements that turn out to be news are
//! flooded to every other neighbour. RPC messages are handed to the RPC
//! client on their own task so a slow service never holds up the channel's
//! reader.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use overlink_core::{
    ChannelEventHandler, ChannelHandle, ChannelId, CloseReason, InstanceNodeSessionId,
    NodeIdentifier,
};
use overlink_routing::{LinkStateAdvertisement, TopologyService};
use overlink_rpc::RpcClient;

use crate::message::NodeMessage;
use crate::neighbours::NeighbourTable;

/// Latency reported for new links; routes are chosen by hop count
const DEFAULT_LINK_LATENCY_MS: u32 = 0;

pub(crate) struct NodeEventHandler {
    local: InstanceNodeSessionId,
    topology: Arc<TopologyService>,
    neighbours: Arc<NeighbourTable>,
    rpc: Arc<RpcClient>,
}

impl NodeEventHandler {
    pub(crate) fn new(
        topology: Arc<TopologyService>,
        neighbours: Arc<NeighbourTable>,
        rpc: Arc<RpcClient>,
    ) -> Self {
        Self {
            local: topology.local_node().clone(),
            topology,
            neighbours,
            rpc,
        }
    }

    /// Send advertisements to every neighbour except `except`
    pub(crate) fn flood(&self, advertisements: Vec<LinkStateAdvertisement>, except: Option<&ChannelId>) {
        if advertisements.is_empty() {
            return;
        }
        let targets = self.neighbours.all_except(except);
        if targets.is_empty() {
            return;
        }
        let payload = match NodeMessage::LinkState(advertisements).encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(node = %self.local.short_id(), error = %e, "Cannot encode advertisements");
                return;
            }
        };
        tokio::spawn(send_to_all(targets, payload));
    }

    fn apply_advertisements(&self, channel: &ChannelHandle, batch: Vec<LinkStateAdvertisement>) {
        let fresh: Vec<LinkStateAdvertisement> = batch
            .into_iter()
            .filter(|lsa| self.topology.apply_advertisement(lsa.clone()))
            .collect();
        if !fresh.is_empty() {
            debug!(
                node = %self.local.short_id(),
                from = %channel.remote_node_id().short_id(),
                count = fresh.len(),
                "Flooding advertisements"
            );
            self.flood(fresh, Some(channel.channel_id()));
        }
    }
}

async fn send_to_all(targets: Vec<ChannelHandle>, payload: Bytes) {
    for channel in targets {
        if let Err(e) = channel.send(payload.clone()).await {
            debug!(channel = %channel.channel_id(), error = %e, "Dropping advertisement");
        }
    }
}

#[async_trait]
impl ChannelEventHandler for NodeEventHandler {
    async fn on_channel_established(&self, channel: ChannelHandle) {
        let remote = channel.remote_node_id().clone();
        // In the table before the topology can route over it
        self.neighbours.insert(channel.clone());
        let lsa = match self.topology.on_link_established(
            channel.channel_id().as_str(),
            remote.clone(),
            DEFAULT_LINK_LATENCY_MS,
        ) {
            Ok(lsa) => lsa,
            Err(e) => {
                warn!(
                    node = %self.local.short_id(),
                    channel = %channel.channel_id(),
                    error = %e,
                    "Refusing channel"
                );
                self.neighbours.remove(channel.channel_id());
                channel.close().await;
                return;
            }
        };
        info!(
            node = %self.local.short_id(),
            channel = %channel.channel_id(),
            remote = %remote.short_id(),
            remote_name = %channel.remote_display_name(),
            transport = %channel.transport_id(),
            "Neighbour connected"
        );

        match NodeMessage::LinkState(self.topology.advertisement_batch()).encode() {
            Ok(payload) => {
                tokio::spawn(send_to_all(vec![channel.clone()], payload));
            }
            Err(e) => warn!(node = %self.local.short_id(), error = %e, "Cannot encode advertisement batch"),
        }
        self.flood(vec![lsa], Some(channel.channel_id()));
    }

    async fn on_message(&self, channel: &ChannelHandle, payload: Bytes) {
        match NodeMessage::decode(&payload) {
            Ok(NodeMessage::LinkState(batch)) => self.apply_advertisements(channel, batch),
            Ok(NodeMessage::Rpc(message)) => {
                let rpc = Arc::clone(&self.rpc);
                tokio::spawn(async move { rpc.handle_message(message).await });
            }
            Err(e) => {
                warn!(
                    node = %self.local.short_id(),
                    channel = %channel.channel_id(),
                    error = %e,
                    "Dropping undecodable message"
                );
            }
        }
    }

    async fn on_channel_closed(&self, channel: ChannelHandle, reason: CloseReason) {
        if self.neighbours.remove(channel.channel_id()).is_none() {
            return;
        }
        let remote = channel.remote_node_id().short_id();
        if reason.is_clean() {
            info!(node = %self.local.short_id(), %remote, %reason, "Neighbour disconnected");
        } else {
            warn!(node = %self.local.short_id(), %remote, %reason, "Neighbour lost");
        }
        if let Some(lsa) = self.topology.on_link_closed(channel.channel_id().as_str()) {
            self.flood(vec![lsa], None);
        }
    }
}

//! Messages exchanged between neighbouring nodes
//!
//! Every payload on a node channel is one postcard-encoded [`NodeMessage`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use overlink_routing::LinkStateAdvertisement;
use overlink_rpc::RpcMessage;

/// Payload of a node channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeMessage {
    /// Advertisements to apply and flood on
    LinkState(Vec<LinkStateAdvertisement>),
    /// An RPC request or response travelling toward its destination
    Rpc(RpcMessage),
}

impl NodeMessage {
    /// Serialize to bytes
    pub fn encode(&self) -> Result<Bytes, postcard::Error> {
        postcard::to_allocvec(self).map(Bytes::from)
    }

    /// Deserialize from bytes
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }
}

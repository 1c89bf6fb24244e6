//! Transport provider contract
//!
//! Every transport (direct TCP, uplink relay, in-memory virtual) implements
//! [`TransportProvider`] and reports channel lifecycle and inbound messages
//! to one [`ChannelEventHandler`]. Upper layers only see [`ChannelHandle`]s.
//!
//! ## Implementations
//!
//! - [`VirtualTransportProvider`](crate::VirtualTransportProvider): in-memory, in this crate
//! - `DirectTransportProvider`: one TCP socket per channel (overlink-transport)
//! - `UplinkTransportProvider`: logical channels over a relay connection (overlink-uplink)

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelHandle, CloseReason};
use crate::contact::NetworkContactPoint;
use crate::error::{TransportError, TransportResult};
use crate::identity::InstanceNodeSessionId;

/// Version of the node handshake and framing
pub const PROTOCOL_VERSION: u32 = 1;

/// Node information exchanged when a channel opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    pub node_id: InstanceNodeSessionId,
    pub display_name: String,
    pub protocol_version: u32,
}

impl HandshakeInfo {
    pub fn new(node_id: InstanceNodeSessionId, display_name: impl Into<String>) -> Self {
        Self {
            node_id,
            display_name: display_name.into(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Check the remote side's handshake against ours
    pub fn verify_remote(&self, remote: &HandshakeInfo) -> TransportResult<()> {
        if remote.protocol_version != self.protocol_version {
            return Err(TransportError::Handshake(format!(
                "protocol version mismatch: local {}, remote {}",
                self.protocol_version, remote.protocol_version
            )));
        }
        if remote.node_id == self.node_id {
            return Err(TransportError::Handshake(
                "remote node has the same session id as the local node".into(),
            ));
        }
        Ok(())
    }
}

/// Receives channel lifecycle events and inbound messages
///
/// Providers call `on_channel_established` before delivering any message of
/// that channel, deliver messages of one channel in order, and call
/// `on_channel_closed` exactly once per established channel.
#[async_trait]
pub trait ChannelEventHandler: Send + Sync + 'static {
    async fn on_channel_established(&self, channel: ChannelHandle);

    async fn on_message(&self, channel: &ChannelHandle, payload: Bytes);

    async fn on_channel_closed(&self, channel: ChannelHandle, reason: CloseReason);
}

/// What every provider needs from its owner
#[derive(Clone)]
pub struct TransportContext {
    /// The local node as announced in handshakes
    pub local: HandshakeInfo,
    pub handler: Arc<dyn ChannelEventHandler>,
}

impl TransportContext {
    pub fn new(local: HandshakeInfo, handler: Arc<dyn ChannelEventHandler>) -> Self {
        Self { local, handler }
    }
}

/// A pluggable transport
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Id matched against [`NetworkContactPoint::transport_id`]
    fn transport_id(&self) -> &str;

    /// Open a channel; returns only once it is Established
    ///
    /// # Errors
    ///
    /// [`TransportError::Unreachable`] when the contact point cannot be
    /// reached or the handshake fails.
    async fn connect(&self, contact_point: &NetworkContactPoint) -> TransportResult<ChannelHandle>;

    /// Start accepting inbound channels at `contact_point`
    ///
    /// Returns the bound contact point, which differs from the argument when
    /// an ephemeral port was requested.
    async fn create_channel_endpoint(
        &self,
        contact_point: &NetworkContactPoint,
    ) -> TransportResult<NetworkContactPoint>;

    /// Stop accepting, close every channel owned by this provider
    async fn shutdown(&self);
}

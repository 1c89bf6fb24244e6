//! In-memory transport for testing
//!
//! A [`VirtualNetwork`] is a shared hub where [`VirtualTransportProvider`]s
//! register server endpoints and open channels to each other. Channels
//! follow the same contract as socket-backed ones: handshake check on
//! connect, ordered delivery per channel, exactly one close notification.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use overlink_core::{VirtualNetwork, NetworkContactPoint};
//!
//! let network = VirtualNetwork::new();
//! let server = network.provider(server_context);
//! let client = network.provider(client_context);
//!
//! let bound = server
//!     .create_channel_endpoint(&NetworkContactPoint::any_port("virtual", "y")?)
//!     .await?;
//! let channel = client.connect(&bound).await?;
//! channel.send(Bytes::from_static(b"hello")).await?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info};

use crate::channel::{
    ChannelHandle, ChannelId, ChannelState, ChannelStateCell, CloseReason, MessageChannel,
};
use crate::contact::NetworkContactPoint;
use crate::error::{TransportError, TransportResult};
use crate::identity::{InstanceNodeSessionId, NodeIdentifier};
use crate::transport::{ChannelEventHandler, HandshakeInfo, TransportContext, TransportProvider};

/// Transport id of the in-memory transport
pub const VIRTUAL_TRANSPORT_ID: &str = "virtual";

const FIRST_EPHEMERAL_PORT: u16 = 20000;

enum VirtualFrame {
    Data(Bytes),
    Goodbye,
}

struct VirtualEndpoint {
    owner: u64,
    context: TransportContext,
}

/// Shared in-memory "network" connecting virtual providers
pub struct VirtualNetwork {
    endpoints: DashMap<(String, u16), VirtualEndpoint>,
    channels: DashMap<ChannelId, Arc<VirtualChannel>>,
    next_port: AtomicU16,
    next_owner: AtomicU64,
}

impl VirtualNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            channels: DashMap::new(),
            next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            next_owner: AtomicU64::new(1),
        })
    }

    /// Create a provider attached to this network
    pub fn provider(self: &Arc<Self>, context: TransportContext) -> VirtualTransportProvider {
        VirtualTransportProvider {
            owner: self.next_owner.fetch_add(1, Ordering::Relaxed),
            network: Arc::clone(self),
            context,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Close every channel between two sessions, in both directions
    ///
    /// Returns the number of channels closed.
    pub async fn disconnect(&self, a: &InstanceNodeSessionId, b: &InstanceNodeSessionId) -> usize {
        let matching: Vec<Arc<VirtualChannel>> = self
            .channels
            .iter()
            .filter(|entry| {
                let ch = entry.value();
                (&ch.local_node == a && ch.remote_node_id() == b)
                    || (&ch.local_node == b && ch.remote_node_id() == a)
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for channel in &matching {
            channel.close().await;
        }
        matching.len()
    }

    /// Number of live channel ends (two per connection)
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// One end of an in-memory channel
pub struct VirtualChannel {
    id: ChannelId,
    owner: u64,
    local_node: InstanceNodeSessionId,
    remote: HandshakeInfo,
    state: ChannelStateCell,
    outbound: mpsc::UnboundedSender<VirtualFrame>,
    close_signal: Notify,
}

impl std::fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("id", &self.id)
            .field("remote", &self.remote.node_id)
            .field("state", &self.state.get())
            .finish()
    }
}

#[async_trait]
impl MessageChannel for VirtualChannel {
    fn channel_id(&self) -> &ChannelId {
        &self.id
    }

    fn remote_node_id(&self) -> &InstanceNodeSessionId {
        &self.remote.node_id
    }

    fn remote_display_name(&self) -> &str {
        &self.remote.display_name
    }

    fn transport_id(&self) -> &str {
        VIRTUAL_TRANSPORT_ID
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }

    async fn send(&self, payload: Bytes) -> TransportResult<()> {
        if self.state.get() != ChannelState::Established {
            return Err(TransportError::ChannelClosed(self.id.to_string()));
        }
        self.outbound
            .send(VirtualFrame::Data(payload))
            .map_err(|_| TransportError::ChannelClosed(self.id.to_string()))
    }

    async fn close(&self) {
        if self.state.begin_closing() {
            let _ = self.outbound.send(VirtualFrame::Goodbye);
            self.close_signal.notify_one();
        }
    }
}

/// Receive loop for one channel end; owns the close notification
async fn run_reader(
    network: Arc<VirtualNetwork>,
    channel: Arc<VirtualChannel>,
    mut inbound: mpsc::UnboundedReceiver<VirtualFrame>,
    handler: Arc<dyn ChannelEventHandler>,
) {
    let handle: ChannelHandle = channel.clone();
    let reason = loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(VirtualFrame::Data(payload)) => handler.on_message(&handle, payload).await,
                Some(VirtualFrame::Goodbye) => break CloseReason::RemoteGoodbye,
                None => break CloseReason::Io("peer went away".into()),
            },
            _ = channel.close_signal.notified() => break CloseReason::Local,
        }
    };

    if channel.state.mark_closed() {
        network.channels.remove(&channel.id);
        debug!(channel = %channel.id, %reason, "Virtual channel closed");
        handler.on_channel_closed(handle, reason).await;
    }
}

/// In-memory transport provider
pub struct VirtualTransportProvider {
    owner: u64,
    network: Arc<VirtualNetwork>,
    context: TransportContext,
    shut_down: AtomicBool,
}

impl VirtualTransportProvider {
    fn new_end(
        &self,
        owner: u64,
        local_node: &InstanceNodeSessionId,
        remote: &HandshakeInfo,
        outbound: mpsc::UnboundedSender<VirtualFrame>,
    ) -> Arc<VirtualChannel> {
        Arc::new(VirtualChannel {
            id: ChannelId::generate(VIRTUAL_TRANSPORT_ID),
            owner,
            local_node: local_node.clone(),
            remote: remote.clone(),
            state: ChannelStateCell::new(),
            outbound,
            close_signal: Notify::new(),
        })
    }
}

#[async_trait]
impl TransportProvider for VirtualTransportProvider {
    fn transport_id(&self) -> &str {
        VIRTUAL_TRANSPORT_ID
    }

    async fn connect(&self, contact_point: &NetworkContactPoint) -> TransportResult<ChannelHandle> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::ShutDown);
        }
        let key = (contact_point.host().to_string(), contact_point.port());
        let (server_owner, server_context) = match self.network.endpoints.get(&key) {
            Some(endpoint) => (endpoint.owner, endpoint.context.clone()),
            None => {
                return Err(TransportError::unreachable(
                    contact_point,
                    "no virtual endpoint at this address",
                ));
            }
        };

        self.context
            .local
            .verify_remote(&server_context.local)
            .map_err(|e| TransportError::unreachable(contact_point, e))?;

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let local_node = &self.context.local.node_id;
        let client_end = self.new_end(self.owner, local_node, &server_context.local, client_tx);
        let server_end = self.new_end(
            server_owner,
            &server_context.local.node_id,
            &self.context.local,
            server_tx,
        );

        for end in [&client_end, &server_end] {
            end.state.mark_established();
            self.network.channels.insert(end.id.clone(), Arc::clone(end));
        }

        server_context
            .handler
            .on_channel_established(server_end.clone())
            .await;
        tokio::spawn(run_reader(
            Arc::clone(&self.network),
            server_end,
            server_rx,
            server_context.handler.clone(),
        ));

        self.context
            .handler
            .on_channel_established(client_end.clone())
            .await;
        tokio::spawn(run_reader(
            Arc::clone(&self.network),
            client_end.clone(),
            client_rx,
            self.context.handler.clone(),
        ));

        debug!(
            local = %local_node.short_id(),
            remote = %server_context.local.node_id.short_id(),
            channel = %client_end.id,
            "Virtual channel established"
        );
        Ok(client_end)
    }

    async fn create_channel_endpoint(
        &self,
        contact_point: &NetworkContactPoint,
    ) -> TransportResult<NetworkContactPoint> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::ShutDown);
        }
        let bound = if contact_point.is_any_port() {
            let port = self.network.next_port.fetch_add(1, Ordering::Relaxed);
            contact_point
                .with_port(port)
                .map_err(|e| TransportError::EndpointFailed {
                    contact_point: contact_point.to_string(),
                    reason: e.to_string(),
                })?
        } else {
            contact_point.clone()
        };

        let key = (bound.host().to_string(), bound.port());
        match self.network.endpoints.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransportError::EndpointFailed {
                contact_point: bound.to_string(),
                reason: "address in use".into(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(VirtualEndpoint {
                    owner: self.owner,
                    context: self.context.clone(),
                });
                info!(endpoint = %bound, "Virtual endpoint listening");
                Ok(bound)
            }
        }
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.network
            .endpoints
            .retain(|_, endpoint| endpoint.owner != self.owner);

        let owned: Vec<Arc<VirtualChannel>> = self
            .network
            .channels
            .iter()
            .filter(|entry| entry.value().owner == self.owner)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for channel in owned {
            channel.close().await;
        }
        debug!(node = %self.context.local.node_id.short_id(), "Virtual transport shut down");
    }
}

//! Uplink transport provider
//!
//! Carries node message channels over uplink sessions. `connect` reuses the
//! open session to a contact point or opens a new physical connection, then
//! opens a `Messaging` logical channel on it. Both ends of that channel
//! exchange their [`HandshakeInfo`] as the first message (opener first),
//! after which the channel behaves like any other [`MessageChannel`].
//!
//! Through an [`UplinkRelay`](crate::relay::UplinkRelay) the same channel
//! carries a destination; the relay forwards it to the session that
//! announced the destination's namespace. Every session, inbound or
//! outbound, accepts messaging channels addressed to no one or to our own
//! namespace.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use overlink_core::{
    ChannelHandle, ChannelId, ChannelState, ChannelStateCell, CloseReason, HandshakeInfo,
    InstanceNodeSessionId, MessageChannel, NetworkContactPoint, NodeIdentifier,
    TransportContext, TransportError, TransportProvider, TransportResult,
};

use crate::endpoint::{ChannelDelivery, DisposeReason, LogicalChannel, StandardEndpointFactory};
use crate::protocol::{ChannelKind, ChannelOpenRequest, destination_matches};
use crate::session::{ChannelWriter, UplinkConfig, UplinkSession};

/// Transport id of the uplink transport
pub const UPLINK_TRANSPORT_ID: &str = "uplink";

const NODE_CHANNEL_LABEL: &str = "node";
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Node message channel riding on one logical uplink channel
pub struct UplinkMessageChannel {
    id: ChannelId,
    remote: HandshakeInfo,
    state: ChannelStateCell,
    writer: ChannelWriter,
    session: UplinkSession,
    close_reason: Mutex<Option<CloseReason>>,
}

impl UplinkMessageChannel {
    fn new(remote: HandshakeInfo, writer: ChannelWriter, session: UplinkSession) -> Self {
        Self {
            id: ChannelId::generate(UPLINK_TRANSPORT_ID),
            remote,
            state: ChannelStateCell::new(),
            writer,
            session,
            close_reason: Mutex::new(None),
        }
    }

    /// Logical channel id on the uplink session
    pub fn logical_channel_id(&self) -> u32 {
        self.writer.channel_id()
    }

    pub fn session(&self) -> &UplinkSession {
        &self.session
    }

    fn initiate_close(&self, reason: CloseReason) {
        if !self.state.begin_closing() {
            return;
        }
        *self.close_reason.lock() = Some(reason);
        self.writer.close();
    }

    fn final_reason(&self, disposed: DisposeReason) -> CloseReason {
        if let Some(reason) = self.close_reason.lock().take() {
            return reason;
        }
        match disposed {
            DisposeReason::LocalClose => CloseReason::Local,
            DisposeReason::RemoteClose | DisposeReason::SessionClosed => CloseReason::RemoteGoodbye,
            DisposeReason::RelayConnectionLost(error) => CloseReason::Io(error.to_string()),
        }
    }
}

impl std::fmt::Debug for UplinkMessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UplinkMessageChannel")
            .field("id", &self.id)
            .field("logical_channel", &self.writer.channel_id())
            .field("remote", &self.remote.node_id)
            .field("state", &self.state.get())
            .finish()
    }
}

#[async_trait]
impl MessageChannel for UplinkMessageChannel {
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
        UPLINK_TRANSPORT_ID
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }

    async fn send(&self, payload: Bytes) -> TransportResult<()> {
        if self.state.get() != ChannelState::Established {
            return Err(TransportError::ChannelClosed(self.id.to_string()));
        }
        self.writer
            .send_message(&payload)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        self.initiate_close(CloseReason::Local);
    }
}

struct Shared {
    context: TransportContext,
    config: UplinkConfig,
    channels: DashMap<ChannelId, Arc<UplinkMessageChannel>>,
    /// Every live session, inbound and outbound
    sessions: Mutex<Vec<UplinkSession>>,
    /// Outbound sessions keyed by socket address
    outbound: DashMap<String, UplinkSession>,
    /// Serializes opening outbound sessions so concurrent connects share one
    connecting: AsyncMutex<()>,
}

impl Shared {
    fn track_session(&self, session: &UplinkSession) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_closed());
        sessions.push(session.clone());
    }

    /// The open session to `contact_point`, connecting if there is none
    async fn session_for(
        self: &Arc<Self>,
        contact_point: &NetworkContactPoint,
    ) -> TransportResult<UplinkSession> {
        if contact_point.is_any_port() {
            return Err(TransportError::unreachable(contact_point, "no port given"));
        }
        let address = contact_point.socket_address();
        let _connecting = self.connecting.lock().await;
        if let Some(session) = self.outbound.get(&address).map(|s| s.value().clone()) {
            if !session.is_closed() {
                debug!(address = %address, "Reusing uplink session");
                return Ok(session);
            }
            self.outbound.remove(&address);
        }

        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(address.as_str()))
            .await
            .map_err(|_| TransportError::unreachable(contact_point, "connect timed out"))?
            .map_err(|e| {
                warn!(error = %e, "Connection failed");
                TransportError::unreachable(contact_point, e)
            })?;
        let _ = stream.set_nodelay(true);

        let (factory, accepted) = messaging_factory(self.config.namespace.clone());
        let session = UplinkSession::connect(
            stream,
            self.context.local.display_name.clone(),
            self.config.clone(),
            Arc::new(factory),
        )
        .await
        .map_err(|e| TransportError::unreachable(contact_point, e))?;
        self.track_session(&session);
        self.outbound.insert(address, session.clone());
        tokio::spawn(run_session_acceptor(Arc::clone(self), session.clone(), accepted));
        Ok(session)
    }

    /// Open a messaging channel on `session` and run the node handshake
    async fn open_node_channel(
        self: &Arc<Self>,
        session: UplinkSession,
        destination: Option<&str>,
        contact_point: &NetworkContactPoint,
    ) -> TransportResult<Arc<UplinkMessageChannel>> {
        let mut request = ChannelOpenRequest::new(ChannelKind::Messaging, NODE_CHANNEL_LABEL);
        if let Some(destination) = destination {
            request = request.with_destination(destination);
        }
        let logical = session
            .open_channel(request)
            .map_err(|e| TransportError::unreachable(contact_point, e))?;
        self.establish(session, logical, true)
            .await
            .map_err(|e| TransportError::unreachable(contact_point, e))
    }

    /// Exchange node handshakes over a fresh messaging channel
    async fn establish(
        self: &Arc<Self>,
        session: UplinkSession,
        logical: LogicalChannel,
        initiator: bool,
    ) -> TransportResult<Arc<UplinkMessageChannel>> {
        let (writer, mut deliveries) = logical.into_parts();
        let local = &self.context.local;

        let send_local = |writer: &ChannelWriter| -> TransportResult<()> {
            let encoded = postcard::to_allocvec(local)
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
            writer
                .send_message(&Bytes::from(encoded))
                .map_err(|e| TransportError::Handshake(e.to_string()))
        };

        let handshake = async {
            if initiator {
                send_local(&writer)?;
            }
            let remote: HandshakeInfo = match deliveries.recv().await {
                Some(ChannelDelivery::Data(bytes)) => postcard::from_bytes(&bytes)
                    .map_err(|e| TransportError::Handshake(e.to_string()))?,
                Some(ChannelDelivery::Error(message)) => {
                    return Err(TransportError::Handshake(message));
                }
                Some(ChannelDelivery::Closed(_)) | None => {
                    return Err(TransportError::Handshake(
                        "channel closed during handshake".into(),
                    ));
                }
            };
            local.verify_remote(&remote)?;
            if !initiator {
                send_local(&writer)?;
            }
            Ok::<HandshakeInfo, TransportError>(remote)
        };

        let remote = match tokio::time::timeout(self.config.handshake_timeout(), handshake).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                writer.close();
                return Err(e);
            }
            Err(_) => {
                writer.close();
                return Err(TransportError::Handshake("handshake timed out".into()));
            }
        };

        let channel = Arc::new(UplinkMessageChannel::new(remote, writer, session));
        channel.state.mark_established();
        self.channels.insert(channel.id.clone(), Arc::clone(&channel));
        self.context
            .handler
            .on_channel_established(channel.clone())
            .await;
        tokio::spawn(run_pump(Arc::clone(self), Arc::clone(&channel), deliveries));

        info!(
            channel = %channel.id,
            logical_channel = channel.logical_channel_id(),
            remote = %channel.remote.node_id.short_id(),
            remote_name = %channel.remote.display_name,
            initiator,
            "Uplink channel established"
        );
        Ok(channel)
    }
}

/// Deliver messages of one channel; the only place that reports it closed
async fn run_pump(
    shared: Arc<Shared>,
    channel: Arc<UplinkMessageChannel>,
    mut deliveries: mpsc::UnboundedReceiver<ChannelDelivery>,
) {
    let handle: ChannelHandle = channel.clone();
    let reason = loop {
        match deliveries.recv().await {
            Some(ChannelDelivery::Data(message)) => {
                shared.context.handler.on_message(&handle, message).await
            }
            Some(ChannelDelivery::Error(message)) => {
                warn!(channel = %channel.id, error = %message, "Remote reported channel error");
            }
            Some(ChannelDelivery::Closed(disposed)) => break channel.final_reason(disposed),
            None => break CloseReason::Io("delivery queue dropped".into()),
        }
    };

    if channel.state.mark_closed() {
        shared.channels.remove(&channel.id);
        if reason.is_clean() {
            debug!(channel = %channel.id, %reason, "Uplink channel closed");
        } else {
            warn!(channel = %channel.id, %reason, "Uplink channel lost");
        }
        shared.context.handler.on_channel_closed(handle, reason).await;
    }
}

/// Accept node channels opened by the remote side of one session
async fn run_session_acceptor(
    shared: Arc<Shared>,
    session: UplinkSession,
    mut accepted: mpsc::UnboundedReceiver<LogicalChannel>,
) {
    loop {
        let logical = tokio::select! {
            logical = accepted.recv() => logical,
            _ = session.closed() => None,
        };
        let Some(logical) = logical else {
            return;
        };
        let shared = Arc::clone(&shared);
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.establish(session, logical, false).await {
                warn!(error = %e, "Inbound uplink handshake failed");
            }
        });
    }
}

/// Accepts messaging channels addressed to no one or to `namespace`
fn messaging_factory(
    namespace: Option<String>,
) -> (StandardEndpointFactory, mpsc::UnboundedReceiver<LogicalChannel>) {
    let (factory, accepted) = StandardEndpointFactory::new();
    let filter = move |request: &ChannelOpenRequest| {
        request.kind == ChannelKind::Messaging
            && match (&request.destination, &namespace) {
                (None, _) => true,
                (Some(destination), Some(namespace)) => destination_matches(namespace, destination),
                (Some(_), None) => false,
            }
    };
    (factory.with_filter(filter), accepted)
}

async fn run_accept_loop(shared: Arc<Shared>, listener: TcpListener, bound: NetworkContactPoint) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = stream.set_nodelay(true);
                    let (factory, accepted) = messaging_factory(shared.config.namespace.clone());
                    let session = match UplinkSession::accept(
                        stream,
                        shared.context.local.display_name.clone(),
                        shared.config.clone(),
                        Arc::new(factory),
                    )
                    .await
                    {
                        Ok(session) => session,
                        Err(e) => {
                            warn!(peer = %addr, error = %e, "Inbound uplink session failed");
                            return;
                        }
                    };
                    shared.track_session(&session);
                    run_session_acceptor(shared, session, accepted).await;
                });
            }
            Err(e) => {
                warn!(endpoint = %bound, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Transport provider multiplexing node channels over uplink sessions
pub struct UplinkTransportProvider {
    shared: Arc<Shared>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl UplinkTransportProvider {
    pub fn new(context: TransportContext, config: UplinkConfig) -> Self {
        info!(
            node = %context.local.node_id.short_id(),
            "Uplink transport initialized"
        );
        Self {
            shared: Arc::new(Shared {
                context,
                config,
                channels: DashMap::new(),
                sessions: Mutex::new(Vec::new()),
                outbound: DashMap::new(),
                connecting: AsyncMutex::new(()),
            }),
            listeners: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &UplinkConfig {
        &self.shared.config
    }

    /// Live node channels
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    /// Live uplink sessions, inbound and outbound
    pub fn session_count(&self) -> usize {
        let mut sessions = self.shared.sessions.lock();
        sessions.retain(|s| !s.is_closed());
        sessions.len()
    }

    /// Keep a session open to the relay at `relay`, so channels addressed
    /// to our namespace can reach us
    #[instrument(skip(self), fields(relay = %relay))]
    pub async fn attach_relay(&self, relay: &NetworkContactPoint) -> TransportResult<()> {
        self.ensure_running()?;
        if self.shared.config.namespace.is_none() {
            warn!("Attached to relay without a namespace; nothing can be forwarded to us");
        }
        self.shared.session_for(relay).await?;
        info!(namespace = ?self.shared.config.namespace, "Attached to uplink relay");
        Ok(())
    }

    /// Open a node channel to the session serving `destination` behind the
    /// relay at `relay`
    #[instrument(skip(self), fields(relay = %relay))]
    pub async fn connect_via_relay(
        &self,
        relay: &NetworkContactPoint,
        destination: &str,
    ) -> TransportResult<ChannelHandle> {
        self.ensure_running()?;
        let session = self.shared.session_for(relay).await?;
        let channel = self
            .shared
            .open_node_channel(session, Some(destination), relay)
            .await?;
        Ok(channel)
    }

    fn ensure_running(&self) -> TransportResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::ShutDown);
        }
        Ok(())
    }
}

#[async_trait]
impl TransportProvider for UplinkTransportProvider {
    fn transport_id(&self) -> &str {
        UPLINK_TRANSPORT_ID
    }

    #[instrument(skip(self), fields(contact_point = %contact_point))]
    async fn connect(&self, contact_point: &NetworkContactPoint) -> TransportResult<ChannelHandle> {
        self.ensure_running()?;
        let session = self.shared.session_for(contact_point).await?;
        let channel = self
            .shared
            .open_node_channel(session, None, contact_point)
            .await?;
        Ok(channel)
    }

    async fn create_channel_endpoint(
        &self,
        contact_point: &NetworkContactPoint,
    ) -> TransportResult<NetworkContactPoint> {
        self.ensure_running()?;
        let endpoint_error = |reason: String| TransportError::EndpointFailed {
            contact_point: contact_point.to_string(),
            reason,
        };

        let listener = TcpListener::bind(contact_point.socket_address())
            .await
            .map_err(|e| endpoint_error(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| endpoint_error(e.to_string()))?
            .port();
        let bound = contact_point
            .with_port(port)
            .map_err(|e| endpoint_error(e.to_string()))?;

        info!(endpoint = %bound, "Uplink endpoint listening");
        let handle = tokio::spawn(run_accept_loop(
            Arc::clone(&self.shared),
            listener,
            bound.clone(),
        ));
        self.listeners.lock().push(handle);
        Ok(bound)
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down uplink transport");

        for listener in self.listeners.lock().drain(..) {
            listener.abort();
        }
        let channels: Vec<_> = self
            .shared
            .channels
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect();
        for channel in channels {
            channel.initiate_close(CloseReason::Shutdown);
        }
        self.shared.outbound.clear();
        let sessions: Vec<_> = self.shared.sessions.lock().drain(..).collect();
        for session in sessions {
            session.close();
        }
    }
}

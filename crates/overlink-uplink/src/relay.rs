//! Uplink relay
//!
//! Accepts uplink sessions from clients and forwards logical channels
//! between them. A client announces a namespace in its handshake; channels
//! whose `destination` is that namespace, or starts with it followed by
//! `/`, are forwarded to the client's session. The relay opens a matching
//! channel on the destination session and copies DATA, ERROR and close
//! between the two, so fragmented messages pass through unchanged.
//!
//! Namespaces are first come first served. A session whose namespace is
//! already taken is closed with a GOODBYE naming the conflict.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use overlink_core::{UplinkError, UplinkResult};

use crate::block::{BlockType, MessageBlock};
use crate::endpoint::{ChannelEndpoint, ChannelInfo, DisposeReason, EndpointFactory};
use crate::protocol::{ChannelKind, DESTINATION_SEPARATOR, destination_namespace};
use crate::session::{ChannelWriter, UplinkConfig, UplinkSession};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct RelayShared {
    name: String,
    config: UplinkConfig,
    /// Namespace to the session it is assigned to
    namespaces: DashMap<String, UplinkSession>,
    sessions: Mutex<Vec<UplinkSession>>,
    forwarded_channels: AtomicU64,
}

impl RelayShared {
    fn find_session_for_destination(&self, destination: &str) -> Option<UplinkSession> {
        let namespace = destination_namespace(destination);
        let session = self
            .namespaces
            .get(namespace)
            .map(|entry| entry.value().clone())
            .filter(|session| !session.is_closed());
        if session.is_none() {
            debug!(destination, "No session matches destination");
        }
        session
    }

    fn attempt_to_assign_namespace(&self, namespace: &str, session: &UplinkSession) -> bool {
        if namespace.is_empty() || namespace.contains(DESTINATION_SEPARATOR) {
            warn!(namespace, "Refusing malformed namespace");
            return false;
        }
        match self.namespaces.entry(namespace.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    warn!(
                        namespace,
                        holder = %entry.get().remote_name(),
                        requester = %session.remote_name(),
                        "Namespace already in use"
                    );
                    return false;
                }
                entry.insert(session.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
            }
        }
        debug!(namespace, session = %session.remote_name(), "Assigned namespace");
        true
    }

    fn release_namespace(&self, namespace: &str, session: &UplinkSession) {
        let released = self
            .namespaces
            .remove_if(namespace, |_, holder| holder.is_same_session(session))
            .is_some();
        if released {
            debug!(namespace, "Released namespace");
        }
    }

    fn track_session(&self, session: &UplinkSession) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_closed());
        sessions.push(session.clone());
    }
}

/// Relay forwarding channels between the uplink sessions it accepted
pub struct UplinkRelay {
    shared: Arc<RelayShared>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl UplinkRelay {
    pub fn new(name: impl Into<String>, config: UplinkConfig) -> Self {
        let name = name.into();
        info!(relay = %name, "Uplink relay created");
        Self {
            shared: Arc::new(RelayShared {
                name,
                config,
                namespaces: DashMap::new(),
                sessions: Mutex::new(Vec::new()),
                forwarded_channels: AtomicU64::new(0),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Listen on `address` (`host:port`, port 0 for any); returns the
    /// bound address
    pub async fn listen(&self, address: &str) -> UplinkResult<SocketAddr> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| UplinkError::Io(e.to_string()))?;
        let bound = listener
            .local_addr()
            .map_err(|e| UplinkError::Io(e.to_string()))?;
        info!(relay = %self.shared.name, address = %bound, "Uplink relay listening");
        let handle = tokio::spawn(run_relay_accept_loop(Arc::clone(&self.shared), listener));
        self.listeners.lock().push(handle);
        Ok(bound)
    }

    /// Run the relay side of a session on an accepted connection
    ///
    /// Fails if the handshake fails or the announced namespace is taken.
    pub async fn accept_session<S>(&self, stream: S) -> UplinkResult<UplinkSession>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        accept_relay_session(&self.shared, stream).await
    }

    /// Bind `namespace` to `session`; false if another live session holds it
    pub fn attempt_to_assign_namespace(&self, namespace: &str, session: &UplinkSession) -> bool {
        self.shared.attempt_to_assign_namespace(namespace, session)
    }

    /// Unbind `namespace` if `session` holds it
    pub fn release_namespace(&self, namespace: &str, session: &UplinkSession) {
        self.shared.release_namespace(namespace, session)
    }

    /// Session responsible for `destination`
    pub fn find_session_for_destination(&self, destination: &str) -> Option<UplinkSession> {
        self.shared.find_session_for_destination(destination)
    }

    pub fn is_namespace_assigned(&self, namespace: &str) -> bool {
        self.shared.namespaces.contains_key(namespace)
    }

    /// Live client sessions
    pub fn session_count(&self) -> usize {
        let mut sessions = self.shared.sessions.lock();
        sessions.retain(|s| !s.is_closed());
        sessions.len()
    }

    /// Channels forwarded since the relay started
    pub fn forwarded_channels(&self) -> u64 {
        self.shared.forwarded_channels.load(Ordering::Relaxed)
    }

    /// Stop listening and close every client session
    pub fn shutdown(&self) {
        for listener in self.listeners.lock().drain(..) {
            listener.abort();
        }
        let sessions: Vec<_> = self.shared.sessions.lock().drain(..).collect();
        info!(relay = %self.shared.name, sessions = sessions.len(), "Uplink relay shutting down");
        for session in sessions {
            session.close();
        }
        self.shared.namespaces.clear();
    }
}

impl std::fmt::Debug for UplinkRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UplinkRelay")
            .field("name", &self.shared.name)
            .field("namespaces", &self.shared.namespaces.len())
            .finish()
    }
}

async fn accept_relay_session<S>(shared: &Arc<RelayShared>, stream: S) -> UplinkResult<UplinkSession>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let factory = RelayEndpointFactory {
        relay: Arc::clone(shared),
    };
    let session =
        UplinkSession::accept(stream, shared.name.clone(), shared.config.clone(), Arc::new(factory)).await?;

    if let Some(namespace) = session.remote_namespace().map(str::to_string) {
        if !shared.attempt_to_assign_namespace(&namespace, &session) {
            let reason = format!("namespace {namespace} is not available");
            session.close_with_error(&reason);
            return Err(UplinkError::Handshake(reason));
        }
        let (relay, watched) = (Arc::clone(shared), session.clone());
        tokio::spawn(async move {
            watched.closed().await;
            relay.release_namespace(&namespace, &watched);
        });
    }
    shared.track_session(&session);
    info!(
        client = %session.remote_name(),
        namespace = ?session.remote_namespace(),
        "Relay session accepted"
    );
    Ok(session)
}

async fn run_relay_accept_loop(shared: Arc<RelayShared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = stream.set_nodelay(true);
                    if let Err(e) = accept_relay_session(&shared, stream).await {
                        warn!(peer = %addr, error = %e, "Relay session refused");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Relay accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Builds forwarding endpoints for channels clients open at the relay
struct RelayEndpointFactory {
    relay: Arc<RelayShared>,
}

impl EndpointFactory for RelayEndpointFactory {
    fn create_endpoint(
        &self,
        info: &ChannelInfo,
        writer: ChannelWriter,
    ) -> Result<Box<dyn ChannelEndpoint>, String> {
        let request = &info.request;
        let Some(destination) = request.destination.as_deref() else {
            return Err("relayed channels need a destination".into());
        };
        if request.kind == ChannelKind::Control {
            return Err("the control channel cannot be relayed".into());
        }
        let target = self
            .relay
            .find_session_for_destination(destination)
            .ok_or_else(|| format!("no session for destination {destination}"))?;
        let source = writer.session();
        if target.is_same_session(&source) {
            return Err(format!("destination {destination} is the requesting session"));
        }

        let back = writer.clone();
        let forward = target
            .open_channel_with_endpoint(request.clone(), |_| {
                Box::new(RelayedChannelEndpoint::new(back))
            })
            .map_err(|e| format!("cannot open channel to {destination}: {e}"))?;

        let total = self.relay.forwarded_channels.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            from = %source.remote_name(),
            from_channel = info.channel_id,
            to = %target.remote_name(),
            to_channel = forward.channel_id(),
            kind = ?request.kind,
            destination,
            total,
            "Forwarding channel"
        );
        Ok(Box::new(RelayedChannelEndpoint::new(forward)))
    }
}

/// One half of a forwarded channel: copies what arrives on one session to
/// the paired channel on the other
pub struct RelayedChannelEndpoint {
    peer: ChannelWriter,
    blocks: u64,
}

impl RelayedChannelEndpoint {
    pub fn new(peer: ChannelWriter) -> Self {
        Self { peer, blocks: 0 }
    }
}

#[async_trait]
impl ChannelEndpoint for RelayedChannelEndpoint {
    async fn process_message(&mut self, block: MessageBlock) {
        let result = match block.block_type {
            BlockType::Data => self.peer.send(block.payload),
            BlockType::Error => self
                .peer
                .send_error(&String::from_utf8_lossy(&block.payload)),
            other => {
                debug!(channel = self.peer.channel_id(), block_type = ?other, "Not forwarding block");
                return;
            }
        };
        self.blocks += 1;
        if let Err(e) = result {
            warn!(channel = self.peer.channel_id(), error = %e, "Forwarding failed, closing channel");
            self.peer.close();
        }
    }

    async fn dispose(&mut self, reason: DisposeReason) {
        debug!(
            channel = self.peer.channel_id(),
            blocks = self.blocks,
            ?reason,
            "Forwarded channel ended"
        );
        self.peer.close();
    }
}

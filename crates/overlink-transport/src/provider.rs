//! Direct TCP transport provider
//!
//! One TCP socket per channel. Both sides send a handshake frame carrying
//! their [`HandshakeInfo`]; the initiator writes first. After the handshake
//! a reader task per channel delivers frames to the channel event handler
//! and a health check task pings the remote side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use overlink_core::{
    ChannelHandle, ChannelState, CloseReason, HandshakeInfo, MessageChannel, NetworkContactPoint,
    NodeIdentifier, TransportContext, TransportError, TransportProvider, TransportResult,
};

use crate::connection::{
    ChannelRegistry, ChannelStats, DIRECT_TRANSPORT_ID, DirectChannel, DirectTransportConfig,
};
use crate::protocol::{FramingError, WireFrame, read_frame, write_frame};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct Shared {
    context: TransportContext,
    config: DirectTransportConfig,
    registry: ChannelRegistry,
}

impl Shared {
    /// Run the handshake on a fresh socket and register the channel
    async fn establish(
        self: &Arc<Self>,
        stream: TcpStream,
        initiator: bool,
    ) -> TransportResult<Arc<DirectChannel>> {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        let max = self.config.max_frame_size;
        let local = &self.context.local;

        let handshake = async {
            if initiator {
                write_frame(&mut writer, &WireFrame::Handshake(local.clone()), max).await?;
            }
            let remote = match read_frame(&mut reader, max).await? {
                WireFrame::Handshake(remote) => remote,
                other => {
                    return Err(TransportError::Handshake(format!(
                        "expected handshake, got {other:?}"
                    )));
                }
            };
            local.verify_remote(&remote)?;
            if !initiator {
                write_frame(&mut writer, &WireFrame::Handshake(local.clone()), max).await?;
            }
            Ok::<HandshakeInfo, TransportError>(remote)
        };

        let remote = tokio::time::timeout(self.config.handshake_timeout(), handshake)
            .await
            .map_err(|_| TransportError::Handshake("handshake timed out".into()))??;

        let channel = Arc::new(DirectChannel::new(remote, writer, max));
        channel.mark_established();
        self.registry.insert(Arc::clone(&channel));
        self.context
            .handler
            .on_channel_established(channel.clone())
            .await;

        tokio::spawn(run_reader(Arc::clone(self), Arc::clone(&channel), reader));
        if self.config.health_check_interval_ms > 0 {
            tokio::spawn(run_health_check(
                Arc::clone(&channel),
                self.config.health_check_interval(),
                self.config.max_health_check_failures,
            ));
        }

        info!(
            channel = %channel.channel_id(),
            remote = %channel.remote_node_id().short_id(),
            remote_name = %channel.remote_display_name(),
            initiator,
            "Direct channel established"
        );
        Ok(channel)
    }
}

/// Receive loop for one channel; the only place that reports it closed
async fn run_reader(shared: Arc<Shared>, channel: Arc<DirectChannel>, mut reader: OwnedReadHalf) {
    let handle: ChannelHandle = channel.clone();
    let max = shared.config.max_frame_size;

    let reason = loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max) => frame,
            _ = channel.close_signal().notified() => {
                break channel.take_close_reason().unwrap_or(CloseReason::Local);
            }
        };

        match frame {
            Ok(frame) => {
                channel.record_activity();
                match frame {
                    WireFrame::Data(payload) => {
                        shared.context.handler.on_message(&handle, payload).await
                    }
                    WireFrame::Ping(nonce) => {
                        let _ = channel.write(&WireFrame::Pong(nonce)).await;
                    }
                    WireFrame::Pong(_) => {}
                    WireFrame::Goodbye => break CloseReason::RemoteGoodbye,
                    WireFrame::Handshake(_) => {
                        break CloseReason::ProtocolViolation("handshake after establishment".into());
                    }
                }
            }
            Err(FramingError::EndOfStream) => {
                break channel
                    .take_close_reason()
                    .unwrap_or_else(|| CloseReason::Io("connection closed without goodbye".into()));
            }
            Err(e) => {
                break channel
                    .take_close_reason()
                    .unwrap_or(CloseReason::Io(e.to_string()));
            }
        }
    };

    if channel.mark_closed() {
        shared.registry.remove(channel.channel_id());
        if reason.is_clean() {
            debug!(channel = %channel.channel_id(), %reason, "Direct channel closed");
        } else {
            warn!(channel = %channel.channel_id(), %reason, "Direct channel lost");
        }
        shared.context.handler.on_channel_closed(handle, reason).await;
    }
}

async fn run_health_check(channel: Arc<DirectChannel>, interval: Duration, max_failures: u32) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut nonce = 0u64;

    loop {
        ticker.tick().await;
        if channel.state() != ChannelState::Established {
            break;
        }
        if channel.count_ping() > max_failures {
            warn!(
                channel = %channel.channel_id(),
                max_failures,
                "Health check failed, closing channel"
            );
            channel
                .initiate_close(CloseReason::HealthCheckFailed, true)
                .await;
            break;
        }
        nonce += 1;
        let _ = channel.write(&WireFrame::Ping(nonce)).await;
    }
}

async fn run_accept_loop(shared: Arc<Shared>, listener: TcpListener, bound: NetworkContactPoint) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if !shared.registry.has_capacity() {
                    warn!(peer = %addr, endpoint = %bound, "Channel limit reached, rejecting");
                    continue;
                }
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = shared.establish(stream, false).await {
                        warn!(peer = %addr, error = %e, "Inbound handshake failed");
                    }
                });
            }
            Err(e) => {
                warn!(endpoint = %bound, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Transport provider opening one TCP socket per channel
pub struct DirectTransportProvider {
    shared: Arc<Shared>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl DirectTransportProvider {
    pub fn new(context: TransportContext, config: DirectTransportConfig) -> Self {
        let registry = ChannelRegistry::new(config.max_channels);
        info!(
            node = %context.local.node_id.short_id(),
            "Direct transport initialized"
        );
        Self {
            shared: Arc::new(Shared {
                context,
                config,
                registry,
            }),
            listeners: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DirectTransportConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.shared.registry
    }

    pub fn stats(&self) -> ChannelStats {
        self.shared.registry.stats()
    }

    fn ensure_running(&self) -> TransportResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::ShutDown);
        }
        Ok(())
    }
}

#[async_trait]
impl TransportProvider for DirectTransportProvider {
    fn transport_id(&self) -> &str {
        DIRECT_TRANSPORT_ID
    }

    #[instrument(skip(self), fields(contact_point = %contact_point))]
    async fn connect(&self, contact_point: &NetworkContactPoint) -> TransportResult<ChannelHandle> {
        self.ensure_running()?;
        if contact_point.is_any_port() {
            return Err(TransportError::unreachable(contact_point, "no port given"));
        }
        if !self.shared.registry.has_capacity() {
            return Err(TransportError::unreachable(
                contact_point,
                "channel limit reached",
            ));
        }

        let stream = tokio::time::timeout(
            self.shared.config.connect_timeout(),
            TcpStream::connect(contact_point.socket_address()),
        )
        .await
        .map_err(|_| {
            warn!(
                timeout_ms = self.shared.config.connect_timeout_ms,
                "Connection timeout"
            );
            TransportError::unreachable(contact_point, "connect timed out")
        })?
        .map_err(|e| {
            warn!(error = %e, "Connection failed");
            TransportError::unreachable(contact_point, e)
        })?;

        let channel = self
            .shared
            .establish(stream, true)
            .await
            .map_err(|e| TransportError::unreachable(contact_point, e))?;
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

        info!(endpoint = %bound, "Direct endpoint listening");
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
        info!("Shutting down direct transport");

        for listener in self.listeners.lock().drain(..) {
            listener.abort();
        }
        for channel in self.shared.registry.drain() {
            channel.initiate_close(CloseReason::Shutdown, true).await;
        }
    }
}

//! Uplink session: one physical connection carrying many logical channels
//!
//! Tasks of one session:
//!
//! - reader: decodes blocks and queues each one to the worker of its channel
//! - one worker per logical channel, driving that channel's endpoint
//! - writer: drains the outbound queue round-robin across channels
//! - heartbeat: sends HEARTBEAT blocks and tears the session down when the
//!   remote side goes silent
//!
//! The channel table lock is held for map operations only, never across
//! I/O or endpoint processing, so a slow endpoint only delays its own
//! channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use overlink_core::{UplinkError, UplinkResult};

use crate::allocator::{ChannelIdAllocator, ConnectionSide};
use crate::block::{
    BlockCodecError, BlockType, DEFAULT_CHANNEL_ID, MAX_BLOCK_PAYLOAD, MessageBlock, read_block,
    read_protocol_header, write_block, write_protocol_header,
};
use crate::endpoint::{
    ChannelEndpoint, ChannelInfo, DefaultChannelEndpoint, DisposeReason, EndpointFactory,
    LogicalChannel, fragment_message, standard_endpoint,
};
use crate::protocol::{
    ChannelKind, ChannelOpenRequest, UPLINK_PROTOCOL_VERSION, UplinkHandshake, decode_control,
    encode_control,
};

/// Configuration for uplink sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Interval between HEARTBEAT blocks in milliseconds; 0 disables them
    pub heartbeat_interval_ms: u64,
    /// Silence after which the physical connection is considered dead
    pub heartbeat_timeout_ms: u64,
    /// How long a released channel id stays unused
    pub channel_id_grace_ms: u64,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Protocol header and HANDSHAKE exchange timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// Largest block payload sent or accepted
    pub max_block_payload: usize,
    /// Maximum number of open logical channels, not counting the default one
    pub max_channels: usize,
    /// Namespace announced in the handshake; a relay forwards channels
    /// addressed to it to this session
    pub namespace: Option<String>,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            channel_id_grace_ms: 10_000,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            max_block_payload: MAX_BLOCK_PAYLOAD,
            max_channels: 1024,
            namespace: None,
        }
    }
}

impl UplinkConfig {
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self.heartbeat_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_channel_id_grace(mut self, grace: Duration) -> Self {
        self.channel_id_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_block_payload(mut self, size: usize) -> Self {
        self.max_block_payload = size;
        self
    }

    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels = max;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn channel_id_grace(&self) -> Duration {
        Duration::from_millis(self.channel_id_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Session counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UplinkStats {
    pub open_channels: usize,
    pub blocks_sent: u64,
    pub blocks_received: u64,
}

enum WorkerCommand {
    Block(MessageBlock),
    Dispose(DisposeReason),
}

type WorkerTx = mpsc::UnboundedSender<WorkerCommand>;
type WorkerRx = mpsc::UnboundedReceiver<WorkerCommand>;

pub(crate) struct SessionShared {
    remote: UplinkHandshake,
    side: ConnectionSide,
    config: UplinkConfig,
    factory: Arc<dyn EndpointFactory>,
    outbound: mpsc::UnboundedSender<MessageBlock>,
    channels: Mutex<HashMap<u32, WorkerTx>>,
    allocator: Mutex<ChannelIdAllocator>,
    control: Mutex<Option<LogicalChannel>>,
    last_received: Mutex<Instant>,
    blocks_sent: AtomicU64,
    blocks_received: AtomicU64,
    closed: AtomicBool,
    close_error: OnceLock<Arc<UplinkError>>,
    /// Cancelled on any teardown
    shutdown: CancellationToken,
    /// Cancelled when the connection is lost; aborts pending writes
    lost: CancellationToken,
}

impl SessionShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn closed_error(&self) -> UplinkError {
        self.close_error
            .get()
            .map(|e| (**e).clone())
            .unwrap_or(UplinkError::ChannelClosed(DEFAULT_CHANNEL_ID))
    }

    fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .keys()
            .filter(|id| **id != DEFAULT_CHANNEL_ID)
            .count()
    }

    /// Claim a table slot for `id`; blocks queue up until a worker runs
    fn reserve(&self, id: u32) -> UplinkResult<WorkerRx> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock();
        if self.is_closed() {
            return Err(self.closed_error());
        }
        channels.insert(id, tx);
        Ok(rx)
    }

    fn spawn_worker(&self, id: u32, endpoint: Box<dyn ChannelEndpoint>, commands: WorkerRx) {
        tokio::spawn(run_worker(id, endpoint, commands));
    }

    fn enqueue(&self, block: MessageBlock) -> UplinkResult<()> {
        self.outbound.send(block).map_err(|_| self.closed_error())
    }

    pub(crate) fn send_block(&self, block: MessageBlock) -> UplinkResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if block.payload.len() > self.config.max_block_payload {
            return Err(UplinkError::BlockTooLarge {
                size: block.payload.len(),
                max: self.config.max_block_payload,
            });
        }
        if !self.channels.lock().contains_key(&block.channel_id) {
            return Err(UplinkError::ChannelClosed(block.channel_id));
        }
        self.enqueue(block)
    }

    /// Remove a channel and dispose its endpoint
    pub(crate) fn close_channel(&self, id: u32, reason: DisposeReason, notify_remote: bool) {
        if id == DEFAULT_CHANNEL_ID {
            return;
        }
        let Some(worker) = self.channels.lock().remove(&id) else {
            return;
        };
        if notify_remote && !self.is_closed() {
            let _ = self.enqueue(MessageBlock::close(id));
        }
        if self.side.owns(id) {
            self.allocator.lock().release(id, Instant::now());
        }
        debug!(channel = id, ?reason, "Logical channel closed");
        let _ = worker.send(WorkerCommand::Dispose(reason));
    }

    fn refuse(&self, id: u32, reason: &str) {
        warn!(channel = id, reason, "Refusing logical channel");
        let _ = self.enqueue(MessageBlock::error(id, reason));
        let _ = self.enqueue(MessageBlock::close(id));
    }

    /// Handle one inbound block; false once the session is over
    fn handle_block(self: &Arc<Self>, block: MessageBlock) -> UplinkResult<bool> {
        match block.block_type {
            BlockType::Heartbeat => Ok(true),
            BlockType::Goodbye => {
                if block.payload.is_empty() {
                    info!(remote = %self.remote.node_name, "Remote closed uplink session");
                    self.teardown(None);
                } else {
                    let message = String::from_utf8_lossy(&block.payload).into_owned();
                    self.teardown(Some(UplinkError::RelayConnectionLost(format!(
                        "remote goodbye: {message}"
                    ))));
                }
                Ok(false)
            }
            BlockType::Handshake => Err(UplinkError::Protocol(
                "handshake after establishment".into(),
            )),
            BlockType::ChannelOpen => {
                self.handle_open(block.channel_id, &block.payload);
                Ok(true)
            }
            BlockType::ChannelClose => {
                self.close_channel(block.channel_id, DisposeReason::RemoteClose, false);
                Ok(true)
            }
            BlockType::Data | BlockType::Error => {
                self.dispatch(block);
                Ok(true)
            }
        }
    }

    fn dispatch(&self, block: MessageBlock) {
        let worker = self.channels.lock().get(&block.channel_id).cloned();
        match worker {
            Some(worker) => {
                let _ = worker.send(WorkerCommand::Block(block));
            }
            None => debug!(
                channel = block.channel_id,
                block_type = ?block.block_type,
                "Dropping block for unknown channel"
            ),
        }
    }

    fn handle_open(self: &Arc<Self>, id: u32, payload: &[u8]) {
        if id == DEFAULT_CHANNEL_ID || self.side.owns(id) {
            warn!(channel = id, "CHANNEL_OPEN with an id outside the remote range, ignoring");
            return;
        }
        if self.channels.lock().contains_key(&id) {
            warn!(channel = id, "CHANNEL_OPEN for an open channel, ignoring");
            return;
        }
        let request: ChannelOpenRequest = match decode_control(payload) {
            Ok(request) => request,
            Err(e) => return self.refuse(id, &e.to_string()),
        };
        if request.kind == ChannelKind::Control {
            return self.refuse(id, "the control channel cannot be opened");
        }
        if self.channel_count() >= self.config.max_channels {
            return self.refuse(id, "channel limit reached");
        }

        let Ok(commands) = self.reserve(id) else {
            return;
        };
        let info = ChannelInfo {
            channel_id: id,
            request,
        };
        match self
            .factory
            .create_endpoint(&info, ChannelWriter::new(id, Arc::clone(self)))
        {
            Ok(endpoint) => {
                debug!(channel = id, kind = ?info.request.kind, label = %info.request.label, "Remote opened channel");
                self.spawn_worker(id, endpoint, commands);
            }
            Err(reason) => {
                self.channels.lock().remove(&id);
                self.refuse(id, &reason);
            }
        }
    }

    /// End the session once; `None` is a clean close
    ///
    /// On failure every endpoint receives the same error instance.
    fn teardown(&self, failure: Option<UplinkError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = match failure {
            Some(error) => {
                warn!(remote = %self.remote.node_name, error = %error, "Uplink session lost");
                let error = Arc::new(error);
                let _ = self.close_error.set(Arc::clone(&error));
                self.lost.cancel();
                DisposeReason::RelayConnectionLost(error)
            }
            None => {
                info!(remote = %self.remote.node_name, "Uplink session closed");
                DisposeReason::SessionClosed
            }
        };

        let workers: Vec<_> = self.channels.lock().drain().collect();
        for (_, worker) in workers {
            let _ = worker.send(WorkerCommand::Dispose(reason.clone()));
        }
        self.control.lock().take();
        self.shutdown.cancel();
    }
}

/// Sending side of one logical channel
#[derive(Clone)]
pub struct ChannelWriter {
    channel_id: u32,
    shared: Arc<SessionShared>,
}

impl ChannelWriter {
    pub(crate) fn new(channel_id: u32, shared: Arc<SessionShared>) -> Self {
        Self { channel_id, shared }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// The session this channel belongs to
    pub fn session(&self) -> UplinkSession {
        UplinkSession {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.shared.is_closed() && self.shared.channels.lock().contains_key(&self.channel_id)
    }

    /// Queue one DATA block
    pub fn send(&self, payload: Bytes) -> UplinkResult<()> {
        self.shared
            .send_block(MessageBlock::data(self.channel_id, payload))
    }

    /// Queue a message of any size as a run of DATA fragments
    pub fn send_message(&self, message: &Bytes) -> UplinkResult<()> {
        for fragment in fragment_message(message, self.shared.config.max_block_payload) {
            self.send(fragment)?;
        }
        Ok(())
    }

    pub fn send_error(&self, message: &str) -> UplinkResult<()> {
        self.shared
            .send_block(MessageBlock::error(self.channel_id, message))
    }

    /// Send CHANNEL_CLOSE and dispose the local endpoint without waiting
    /// for the remote side
    pub fn close(&self) {
        self.shared
            .close_channel(self.channel_id, DisposeReason::LocalClose, true);
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("channel_id", &self.channel_id)
            .field("remote", &self.shared.remote.node_name)
            .finish()
    }
}

/// Handle to one multiplexed physical connection
#[derive(Clone)]
pub struct UplinkSession {
    shared: Arc<SessionShared>,
}

impl UplinkSession {
    /// Start a session on a connection this side opened (odd channel ids)
    pub async fn connect<S>(
        stream: S,
        local_name: impl Into<String>,
        config: UplinkConfig,
        factory: Arc<dyn EndpointFactory>,
    ) -> UplinkResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::establish(stream, ConnectionSide::Connector, local_name.into(), config, factory).await
    }

    /// Start a session on an accepted connection (even channel ids)
    pub async fn accept<S>(
        stream: S,
        local_name: impl Into<String>,
        config: UplinkConfig,
        factory: Arc<dyn EndpointFactory>,
    ) -> UplinkResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::establish(stream, ConnectionSide::Acceptor, local_name.into(), config, factory).await
    }

    async fn establish<S>(
        stream: S,
        side: ConnectionSide,
        local_name: String,
        config: UplinkConfig,
        factory: Arc<dyn EndpointFactory>,
    ) -> UplinkResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let max = config.max_block_payload;
        let local = UplinkHandshake::new(local_name).with_namespace(config.namespace.clone());

        let handshake = async {
            write_protocol_header(&mut writer).await?;
            let hello = MessageBlock::new(
                DEFAULT_CHANNEL_ID,
                BlockType::Handshake,
                encode_control(&local)?,
            );
            write_block(&mut writer, &hello, max).await?;
            writer
                .flush()
                .await
                .map_err(|e| UplinkError::Io(e.to_string()))?;

            read_protocol_header(&mut reader).await?;
            let block = read_block(&mut reader, max).await?;
            if block.channel_id != DEFAULT_CHANNEL_ID || block.block_type != BlockType::Handshake {
                return Err(UplinkError::Handshake(format!(
                    "expected handshake, got {:?} on channel {}",
                    block.block_type, block.channel_id
                )));
            }
            let remote: UplinkHandshake = decode_control(&block.payload)?;
            if remote.protocol_version != UPLINK_PROTOCOL_VERSION {
                return Err(UplinkError::Handshake(format!(
                    "protocol version mismatch: local {UPLINK_PROTOCOL_VERSION}, remote {}",
                    remote.protocol_version
                )));
            }
            Ok(remote)
        };

        let remote = tokio::time::timeout(config.handshake_timeout(), handshake)
            .await
            .map_err(|_| UplinkError::Handshake("handshake timed out".into()))?
            .map_err(|e| match e {
                UplinkError::Handshake(_) => e,
                other => UplinkError::Handshake(other.to_string()),
            })?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let allocator = ChannelIdAllocator::new(side, config.channel_id_grace());
        let heartbeat = config.heartbeat_interval_ms > 0;
        let shared = Arc::new(SessionShared {
            remote,
            side,
            config,
            factory,
            outbound,
            channels: Mutex::new(HashMap::new()),
            allocator: Mutex::new(allocator),
            control: Mutex::new(None),
            last_received: Mutex::new(Instant::now()),
            blocks_sent: AtomicU64::new(0),
            blocks_received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_error: OnceLock::new(),
            shutdown: CancellationToken::new(),
            lost: CancellationToken::new(),
        });

        let commands = shared.reserve(DEFAULT_CHANNEL_ID)?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        shared.spawn_worker(
            DEFAULT_CHANNEL_ID,
            Box::new(DefaultChannelEndpoint::new(control_tx)),
            commands,
        );
        *shared.control.lock() = Some(LogicalChannel::new(
            ChannelWriter::new(DEFAULT_CHANNEL_ID, Arc::clone(&shared)),
            ChannelKind::Control,
            "control".into(),
            control_rx,
        ));

        tokio::spawn(run_writer(Arc::clone(&shared), writer, outbound_rx));
        tokio::spawn(run_reader(Arc::clone(&shared), reader));
        if heartbeat {
            tokio::spawn(run_heartbeat(Arc::clone(&shared)));
        }

        info!(
            remote = %shared.remote.node_name,
            side = ?side,
            "Uplink session established"
        );
        Ok(Self { shared })
    }

    pub fn remote_name(&self) -> &str {
        &self.shared.remote.node_name
    }

    /// Namespace the remote side announced, if any
    pub fn remote_namespace(&self) -> Option<&str> {
        self.shared.remote.namespace.as_deref()
    }

    pub fn side(&self) -> ConnectionSide {
        self.shared.side
    }

    /// Whether both handles refer to the same physical connection
    pub fn is_same_session(&self, other: &UplinkSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn config(&self) -> &UplinkConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The error that ended the session, if it was lost
    pub fn close_error(&self) -> Option<Arc<UplinkError>> {
        self.shared.close_error.get().cloned()
    }

    /// Handle of the default channel; available once
    pub fn take_control_channel(&self) -> Option<LogicalChannel> {
        self.shared.control.lock().take()
    }

    /// Open a logical channel; the remote side may still refuse it, which
    /// shows up as an `Error` then `Closed` delivery
    pub fn open_channel(&self, request: ChannelOpenRequest) -> UplinkResult<LogicalChannel> {
        let (tx, deliveries) = mpsc::unbounded_channel();
        let (kind, label) = (request.kind, request.label.clone());
        let writer = self.open_channel_with_endpoint(request, |writer| {
            standard_endpoint(writer.channel_id(), kind, None, tx)
        })?;
        Ok(LogicalChannel::new(writer, kind, label, deliveries))
    }

    /// Open a logical channel whose inbound blocks go to a caller supplied
    /// endpoint
    pub fn open_channel_with_endpoint(
        &self,
        request: ChannelOpenRequest,
        endpoint: impl FnOnce(&ChannelWriter) -> Box<dyn ChannelEndpoint>,
    ) -> UplinkResult<ChannelWriter> {
        let shared = &self.shared;
        if request.kind == ChannelKind::Control {
            return Err(UplinkError::Protocol(
                "the control channel is always open".into(),
            ));
        }
        if shared.is_closed() {
            return Err(shared.closed_error());
        }
        if shared.channel_count() >= shared.config.max_channels {
            return Err(UplinkError::ChannelRefused {
                channel_id: DEFAULT_CHANNEL_ID,
                reason: format!("channel limit {} reached", shared.config.max_channels),
            });
        }
        let payload = encode_control(&request)?;

        let id = shared.allocator.lock().allocate(Instant::now())?;
        let commands = match shared.reserve(id) {
            Ok(commands) => commands,
            Err(e) => {
                shared.allocator.lock().release(id, Instant::now());
                return Err(e);
            }
        };
        let writer = ChannelWriter::new(id, Arc::clone(shared));
        shared.spawn_worker(id, endpoint(&writer), commands);
        shared.enqueue(MessageBlock::new(id, BlockType::ChannelOpen, payload))?;

        debug!(
            channel = id,
            kind = ?request.kind,
            label = %request.label,
            destination = ?request.destination,
            "Opened channel"
        );
        Ok(writer)
    }

    /// Open logical channels, not counting the default one
    pub fn channel_count(&self) -> usize {
        self.shared.channel_count()
    }

    pub fn is_channel_open(&self, id: u32) -> bool {
        self.shared.channels.lock().contains_key(&id)
    }

    /// Whether a released id of ours is still in its grace period
    pub fn is_id_quarantined(&self, id: u32) -> bool {
        self.shared.allocator.lock().is_quarantined(id)
    }

    pub fn stats(&self) -> UplinkStats {
        UplinkStats {
            open_channels: self.channel_count(),
            blocks_sent: self.shared.blocks_sent.load(Ordering::Relaxed),
            blocks_received: self.shared.blocks_received.load(Ordering::Relaxed),
        }
    }

    /// Send GOODBYE and dispose every channel
    pub fn close(&self) {
        if self.shared.is_closed() {
            return;
        }
        let _ = self
            .shared
            .enqueue(MessageBlock::new(DEFAULT_CHANNEL_ID, BlockType::Goodbye, Bytes::new()));
        self.shared.teardown(None);
    }

    /// Send GOODBYE carrying `message`; the remote side treats the session
    /// as lost with that reason
    pub fn close_with_error(&self, message: &str) {
        if self.shared.is_closed() {
            return;
        }
        warn!(remote = %self.shared.remote.node_name, reason = message, "Closing uplink session");
        let _ = self.shared.enqueue(MessageBlock::new(
            DEFAULT_CHANNEL_ID,
            BlockType::Goodbye,
            Bytes::copy_from_slice(message.as_bytes()),
        ));
        self.shared.teardown(None);
    }

    /// Wait until the session is over
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }
}

impl std::fmt::Debug for UplinkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UplinkSession")
            .field("remote", &self.shared.remote.node_name)
            .field("side", &self.shared.side)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

async fn run_worker(channel_id: u32, mut endpoint: Box<dyn ChannelEndpoint>, mut commands: WorkerRx) {
    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Block(block) => endpoint.process_message(block).await,
            WorkerCommand::Dispose(reason) => {
                endpoint.dispose(reason).await;
                return;
            }
        }
    }
    debug!(channel = channel_id, "Worker queue dropped without dispose");
    endpoint.dispose(DisposeReason::SessionClosed).await;
}

async fn run_reader<R>(shared: Arc<SessionShared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let max = shared.config.max_block_payload;
    let failure = loop {
        let result = tokio::select! {
            result = read_block(&mut reader, max) => result,
            _ = shared.shutdown.cancelled() => return,
        };
        let block = match result {
            Ok(block) => block,
            Err(BlockCodecError::EndOfStream) => break "connection closed without goodbye".to_string(),
            Err(e) => break e.to_string(),
        };
        *shared.last_received.lock() = Instant::now();
        shared.blocks_received.fetch_add(1, Ordering::Relaxed);

        match shared.handle_block(block) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => break e.to_string(),
        }
    };
    shared.teardown(Some(UplinkError::RelayConnectionLost(failure)));
}

/// Per-channel queues served in turn; GOODBYE goes out after everything else
#[derive(Default)]
struct RoundRobin {
    queues: HashMap<u32, VecDeque<MessageBlock>>,
    order: VecDeque<u32>,
    goodbye: Option<MessageBlock>,
}

impl RoundRobin {
    fn push(&mut self, block: MessageBlock) {
        if block.block_type == BlockType::Goodbye {
            self.goodbye = Some(block);
            return;
        }
        let queue = self.queues.entry(block.channel_id).or_default();
        if queue.is_empty() {
            self.order.push_back(block.channel_id);
        }
        queue.push_back(block);
    }

    fn pop(&mut self) -> Option<MessageBlock> {
        let Some(id) = self.order.pop_front() else {
            return self.goodbye.take();
        };
        let queue = self.queues.get_mut(&id)?;
        let block = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&id);
        } else {
            self.order.push_back(id);
        }
        block
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty() && self.goodbye.is_none()
    }
}

async fn run_writer<W>(
    shared: Arc<SessionShared>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<MessageBlock>,
) where
    W: AsyncWrite + Unpin,
{
    let max = shared.config.max_block_payload;
    let mut pending = RoundRobin::default();

    loop {
        if pending.is_empty() {
            let next = tokio::select! {
                biased;
                block = outbound.recv() => block,
                _ = shared.shutdown.cancelled() => None,
            };
            match next {
                Some(block) => pending.push(block),
                None => break,
            }
        }
        while let Ok(block) = outbound.try_recv() {
            pending.push(block);
        }
        let Some(block) = pending.pop() else {
            continue;
        };

        let goodbye = block.block_type == BlockType::Goodbye;
        let write = async {
            write_block(&mut writer, &block, max).await?;
            if goodbye || pending.is_empty() {
                writer
                    .flush()
                    .await
                    .map_err(|e| BlockCodecError::Io(e.to_string()))?;
            }
            Ok::<(), BlockCodecError>(())
        };
        let result = tokio::select! {
            result = write => result,
            _ = shared.lost.cancelled() => break,
        };
        if let Err(e) = result {
            shared.teardown(Some(UplinkError::RelayConnectionLost(e.to_string())));
            break;
        }
        shared.blocks_sent.fetch_add(1, Ordering::Relaxed);
        if goodbye {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_heartbeat(shared: Arc<SessionShared>) {
    let timeout = shared.config.heartbeat_timeout();
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval());
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.shutdown.cancelled() => return,
        }
        let silent = shared.last_received.lock().elapsed();
        if silent >= timeout {
            warn!(
                remote = %shared.remote.node_name,
                silent_ms = silent.as_millis() as u64,
                "Heartbeat timeout"
            );
            shared.teardown(Some(UplinkError::RelayConnectionLost(format!(
                "no blocks received for {} ms",
                silent.as_millis()
            ))));
            return;
        }
        let _ = shared.enqueue(MessageBlock::heartbeat());
    }
}

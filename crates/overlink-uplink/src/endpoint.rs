//! Channel endpoints
//!
//! Each open logical channel has one endpoint, driven by its own worker
//! task. Endpoints hand what they receive to the application through a
//! [`LogicalChannel`] handle.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use overlink_core::{UplinkError, UplinkResult};

use crate::block::{BlockType, MessageBlock};
use crate::protocol::{ChannelKind, ChannelOpenRequest, ExecutionRole};
use crate::session::ChannelWriter;

/// Why an endpoint is being disposed
#[derive(Debug, Clone)]
pub enum DisposeReason {
    /// Closed by this side
    LocalClose,
    /// CHANNEL_CLOSE received
    RemoteClose,
    /// The whole uplink session was closed cleanly
    SessionClosed,
    /// The physical connection failed; every endpoint of the session gets
    /// the same error instance
    RelayConnectionLost(Arc<UplinkError>),
}

impl DisposeReason {
    pub fn is_clean(&self) -> bool {
        !matches!(self, DisposeReason::RelayConnectionLost(_))
    }
}

/// Handler for the blocks of one logical channel
#[async_trait]
pub trait ChannelEndpoint: Send + 'static {
    /// Handle a DATA or ERROR block; may take as long as it needs
    async fn process_message(&mut self, block: MessageBlock);

    /// Release the endpoint; called exactly once, last
    async fn dispose(&mut self, reason: DisposeReason);
}

/// What a logical channel hands to the application
#[derive(Debug, Clone)]
pub enum ChannelDelivery {
    Data(Bytes),
    /// ERROR block from the remote side
    Error(String),
    /// Last delivery of every channel
    Closed(DisposeReason),
}

type DeliveryTx = mpsc::UnboundedSender<ChannelDelivery>;

fn deliver(tx: &DeliveryTx, delivery: ChannelDelivery) {
    // The application dropped its handle; nothing left to do
    let _ = tx.send(delivery);
}

fn error_text(block: &MessageBlock) -> String {
    String::from_utf8_lossy(&block.payload).into_owned()
}

/// Endpoint of the default control channel
pub struct DefaultChannelEndpoint {
    deliveries: DeliveryTx,
}

impl DefaultChannelEndpoint {
    pub fn new(deliveries: DeliveryTx) -> Self {
        Self { deliveries }
    }
}

#[async_trait]
impl ChannelEndpoint for DefaultChannelEndpoint {
    async fn process_message(&mut self, block: MessageBlock) {
        match block.block_type {
            BlockType::Data => deliver(&self.deliveries, ChannelDelivery::Data(block.payload)),
            BlockType::Error => {
                let message = error_text(&block);
                warn!(error = %message, "Error on control channel");
                deliver(&self.deliveries, ChannelDelivery::Error(message));
            }
            other => debug!(block_type = ?other, "Ignoring control block"),
        }
    }

    async fn dispose(&mut self, reason: DisposeReason) {
        deliver(&self.deliveries, ChannelDelivery::Closed(reason));
    }
}

/// Endpoint of an execution session channel
pub struct ExecutionChannelEndpoint {
    channel_id: u32,
    role: ExecutionRole,
    deliveries: DeliveryTx,
    blocks_received: u64,
}

impl ExecutionChannelEndpoint {
    pub fn new(channel_id: u32, role: ExecutionRole, deliveries: DeliveryTx) -> Self {
        Self {
            channel_id,
            role,
            deliveries,
            blocks_received: 0,
        }
    }
}

#[async_trait]
impl ChannelEndpoint for ExecutionChannelEndpoint {
    async fn process_message(&mut self, block: MessageBlock) {
        match block.block_type {
            BlockType::Data => {
                self.blocks_received += 1;
                deliver(&self.deliveries, ChannelDelivery::Data(block.payload));
            }
            BlockType::Error => {
                deliver(&self.deliveries, ChannelDelivery::Error(error_text(&block)))
            }
            other => debug!(channel = self.channel_id, block_type = ?other, "Ignoring block"),
        }
    }

    async fn dispose(&mut self, reason: DisposeReason) {
        debug!(
            channel = self.channel_id,
            role = ?self.role,
            blocks = self.blocks_received,
            ?reason,
            "Execution channel disposed"
        );
        deliver(&self.deliveries, ChannelDelivery::Closed(reason));
    }
}

/// Endpoint of a file transfer channel
pub struct FileTransferEndpoint {
    channel_id: u32,
    deliveries: DeliveryTx,
    bytes_received: u64,
}

impl FileTransferEndpoint {
    pub fn new(channel_id: u32, deliveries: DeliveryTx) -> Self {
        Self {
            channel_id,
            deliveries,
            bytes_received: 0,
        }
    }
}

#[async_trait]
impl ChannelEndpoint for FileTransferEndpoint {
    async fn process_message(&mut self, block: MessageBlock) {
        match block.block_type {
            BlockType::Data => {
                self.bytes_received += block.payload.len() as u64;
                deliver(&self.deliveries, ChannelDelivery::Data(block.payload));
            }
            BlockType::Error => {
                deliver(&self.deliveries, ChannelDelivery::Error(error_text(&block)))
            }
            other => debug!(channel = self.channel_id, block_type = ?other, "Ignoring block"),
        }
    }

    async fn dispose(&mut self, reason: DisposeReason) {
        info!(
            channel = self.channel_id,
            bytes = self.bytes_received,
            clean = reason.is_clean(),
            "File transfer channel disposed"
        );
        deliver(&self.deliveries, ChannelDelivery::Closed(reason));
    }
}

const FRAGMENT_MORE: u8 = 0;
const FRAGMENT_FINAL: u8 = 1;

/// Split a message into DATA payloads of at most `max_payload` bytes
///
/// Each payload starts with a flag byte marking the final fragment.
pub fn fragment_message(message: &Bytes, max_payload: usize) -> Vec<Bytes> {
    let chunk_size = max_payload.saturating_sub(1).max(1);
    let mut fragments = Vec::with_capacity(message.len() / chunk_size + 1);
    let mut offset = 0;
    loop {
        let end = (offset + chunk_size).min(message.len());
        let last = end == message.len();
        let mut fragment = BytesMut::with_capacity(1 + end - offset);
        fragment.extend_from_slice(&[if last { FRAGMENT_FINAL } else { FRAGMENT_MORE }]);
        fragment.extend_from_slice(&message[offset..end]);
        fragments.push(fragment.freeze());
        if last {
            return fragments;
        }
        offset = end;
    }
}

/// Endpoint of a messaging channel; reassembles fragmented messages
pub struct MessagingEndpoint {
    channel_id: u32,
    deliveries: DeliveryTx,
    partial: BytesMut,
}

impl MessagingEndpoint {
    pub fn new(channel_id: u32, deliveries: DeliveryTx) -> Self {
        Self {
            channel_id,
            deliveries,
            partial: BytesMut::new(),
        }
    }
}

#[async_trait]
impl ChannelEndpoint for MessagingEndpoint {
    async fn process_message(&mut self, block: MessageBlock) {
        match block.block_type {
            BlockType::Data => {
                let Some((&flag, chunk)) = block.payload.split_first() else {
                    warn!(channel = self.channel_id, "Empty messaging fragment");
                    return;
                };
                self.partial.extend_from_slice(chunk);
                if flag == FRAGMENT_FINAL {
                    let message = self.partial.split().freeze();
                    deliver(&self.deliveries, ChannelDelivery::Data(message));
                }
            }
            BlockType::Error => {
                deliver(&self.deliveries, ChannelDelivery::Error(error_text(&block)))
            }
            other => debug!(channel = self.channel_id, block_type = ?other, "Ignoring block"),
        }
    }

    async fn dispose(&mut self, reason: DisposeReason) {
        if !self.partial.is_empty() {
            debug!(
                channel = self.channel_id,
                bytes = self.partial.len(),
                "Dropping incomplete message"
            );
        }
        deliver(&self.deliveries, ChannelDelivery::Closed(reason));
    }
}

/// Endpoint for a channel of `kind` where this side plays `local_role`
/// on execution channels
pub(crate) fn standard_endpoint(
    channel_id: u32,
    kind: ChannelKind,
    local_role: Option<ExecutionRole>,
    deliveries: DeliveryTx,
) -> Box<dyn ChannelEndpoint> {
    match kind {
        ChannelKind::Control => Box::new(DefaultChannelEndpoint::new(deliveries)),
        ChannelKind::Execution { role } => Box::new(ExecutionChannelEndpoint::new(
            channel_id,
            local_role.unwrap_or(role),
            deliveries,
        )),
        ChannelKind::FileTransfer => Box::new(FileTransferEndpoint::new(channel_id, deliveries)),
        ChannelKind::Messaging => Box::new(MessagingEndpoint::new(channel_id, deliveries)),
    }
}

/// Application handle of one logical channel
pub struct LogicalChannel {
    writer: ChannelWriter,
    kind: ChannelKind,
    label: String,
    deliveries: mpsc::UnboundedReceiver<ChannelDelivery>,
}

impl LogicalChannel {
    pub(crate) fn new(
        writer: ChannelWriter,
        kind: ChannelKind,
        label: String,
        deliveries: mpsc::UnboundedReceiver<ChannelDelivery>,
    ) -> Self {
        Self {
            writer,
            kind,
            label,
            deliveries,
        }
    }

    pub fn id(&self) -> u32 {
        self.writer.channel_id()
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn writer(&self) -> ChannelWriter {
        self.writer.clone()
    }

    /// Send one DATA block
    pub fn send(&self, payload: Bytes) -> UplinkResult<()> {
        self.writer.send(payload)
    }

    /// Send a message of any size as fragments (messaging channels)
    pub fn send_message(&self, message: &Bytes) -> UplinkResult<()> {
        self.writer.send_message(message)
    }

    pub fn send_error(&self, message: &str) -> UplinkResult<()> {
        self.writer.send_error(message)
    }

    /// Next delivery; `None` after the `Closed` delivery was taken
    pub async fn recv(&mut self) -> Option<ChannelDelivery> {
        self.deliveries.recv().await
    }

    /// Send CHANNEL_CLOSE and dispose the local endpoint
    pub fn close(&self) {
        self.writer.close();
    }

    pub fn into_parts(self) -> (ChannelWriter, mpsc::UnboundedReceiver<ChannelDelivery>) {
        (self.writer, self.deliveries)
    }
}

impl std::fmt::Debug for LogicalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalChannel")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("label", &self.label)
            .finish()
    }
}

/// Description of a channel the remote side wants to open
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub channel_id: u32,
    pub request: ChannelOpenRequest,
}

/// Creates endpoints for channels opened by the remote side
pub trait EndpointFactory: Send + Sync + 'static {
    /// Build the endpoint or refuse with a reason sent back in an ERROR block
    fn create_endpoint(
        &self,
        info: &ChannelInfo,
        writer: ChannelWriter,
    ) -> Result<Box<dyn ChannelEndpoint>, String>;
}

type ChannelFilter = Arc<dyn Fn(&ChannelOpenRequest) -> bool + Send + Sync>;

/// Factory building the standard endpoints and handing each new channel
/// to an accept queue
pub struct StandardEndpointFactory {
    accepted: mpsc::UnboundedSender<LogicalChannel>,
    filter: Option<ChannelFilter>,
}

impl StandardEndpointFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogicalChannel>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                filter: None,
            },
            rx,
        )
    }

    /// Refuse requests for which `filter` returns false
    pub fn with_filter(
        mut self,
        filter: impl Fn(&ChannelOpenRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl EndpointFactory for StandardEndpointFactory {
    fn create_endpoint(
        &self,
        info: &ChannelInfo,
        writer: ChannelWriter,
    ) -> Result<Box<dyn ChannelEndpoint>, String> {
        if let Some(filter) = &self.filter {
            if !filter(&info.request) {
                return Err(format!("{:?} channels are not accepted", info.request.kind));
            }
        }
        if self.accepted.is_closed() {
            return Err("not accepting channels".into());
        }

        let local_role = match info.request.kind {
            ChannelKind::Execution { role } => Some(role.counterpart()),
            _ => None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = standard_endpoint(info.channel_id, info.request.kind, local_role, tx);
        let channel = LogicalChannel::new(writer, info.request.kind, info.request.label.clone(), rx);
        self.accepted
            .send(channel)
            .map_err(|_| "not accepting channels".to_string())?;
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_sizes() {
        let message = Bytes::from(vec![9u8; 10]);
        let fragments = fragment_message(&message, 4);
        assert_eq!(fragments.len(), 4);
        assert!(fragments.iter().all(|f| f.len() <= 4));
        assert_eq!(fragments[0][0], FRAGMENT_MORE);
        assert_eq!(fragments[3][0], FRAGMENT_FINAL);

        let empty = fragment_message(&Bytes::new(), 4);
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].as_ref(), &[FRAGMENT_FINAL]);
    }

    #[tokio::test]
    async fn test_messaging_reassembly() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut endpoint = MessagingEndpoint::new(3, tx);
        let message = Bytes::from((0..100u8).collect::<Vec<_>>());

        for fragment in fragment_message(&message, 16) {
            endpoint.process_message(MessageBlock::data(3, fragment)).await;
        }
        endpoint.dispose(DisposeReason::RemoteClose).await;

        match rx.recv().await.unwrap() {
            ChannelDelivery::Data(data) => assert_eq!(data, message),
            other => panic!("unexpected delivery {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelDelivery::Closed(DisposeReason::RemoteClose)
        ));
    }

    #[tokio::test]
    async fn test_file_transfer_counts_bytes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut endpoint = FileTransferEndpoint::new(5, tx);
        endpoint
            .process_message(MessageBlock::data(5, Bytes::from_static(b"abc")))
            .await;
        endpoint.process_message(MessageBlock::error(5, "disk full")).await;
        assert_eq!(endpoint.bytes_received, 3);

        assert!(matches!(rx.recv().await, Some(ChannelDelivery::Data(_))));
        match rx.recv().await {
            Some(ChannelDelivery::Error(message)) => assert_eq!(message, "disk full"),
            other => panic!("unexpected delivery {other:?}"),
        }
    }
}

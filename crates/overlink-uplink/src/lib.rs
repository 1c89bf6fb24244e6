//! # Overlink Uplink
//!
//! Multiplexes many logical channels over one physical relay connection.
//!
//! ## Core Components
//!
//! - [`MessageBlock`]: `[channel id u32][type u8][length u32][payload]`,
//!   one block per frame
//! - [`UplinkSession`]: one physical connection with its reader, writer,
//!   heartbeat and per-channel worker tasks
//! - [`ChannelEndpoint`]: per-channel block handler; the default control
//!   channel, execution channels and file transfer channels ship here
//! - [`ChannelIdAllocator`]: odd/even id ranges and a grace period before
//!   a released id is reused
//! - [`UplinkTransportProvider`]: node message channels over uplink
//!   sessions (transport id `uplink`), directly or through a relay
//! - [`UplinkRelay`]: assigns client namespaces and forwards channels
//!   between the sessions it accepted
//!
//! A slow endpoint only holds up its own channel. When the physical
//! connection dies every open channel is disposed with one shared
//! [`UplinkError::RelayConnectionLost`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use overlink_uplink::{ChannelKind, ChannelOpenRequest, StandardEndpointFactory, UplinkSession};
//!
//! let (factory, _incoming) = StandardEndpointFactory::new();
//! let session = UplinkSession::connect(stream, "worker-7", UplinkConfig::default(), Arc::new(factory)).await?;
//! let mut transfer = session.open_channel(ChannelOpenRequest::new(ChannelKind::FileTransfer, "results.tar"))?;
//! transfer.send(chunk)?;
//! transfer.close();
//! ```

pub mod allocator;
pub mod block;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod session;

// Re-export main types
pub use allocator::{ChannelIdAllocator, ConnectionSide};
pub use block::{
    BLOCK_HEADER_LEN, BlockType, DEFAULT_CHANNEL_ID, MAX_BLOCK_PAYLOAD, MessageBlock,
    PROTOCOL_HEADER, read_block, read_protocol_header, write_block, write_protocol_header,
};
pub use endpoint::{
    ChannelDelivery, ChannelEndpoint, ChannelInfo, DefaultChannelEndpoint, DisposeReason,
    EndpointFactory, ExecutionChannelEndpoint, FileTransferEndpoint, LogicalChannel,
    MessagingEndpoint, StandardEndpointFactory, fragment_message,
};
pub use error::{BlockCodecError, UplinkError, UplinkResult};
pub use protocol::{
    ChannelKind, ChannelOpenRequest, DESTINATION_SEPARATOR, ExecutionRole, UPLINK_PROTOCOL_VERSION,
    UplinkHandshake, destination_matches, destination_namespace,
};
pub use provider::{UPLINK_TRANSPORT_ID, UplinkMessageChannel, UplinkTransportProvider};
pub use relay::{RelayedChannelEndpoint, UplinkRelay};
pub use session::{ChannelWriter, UplinkConfig, UplinkSession, UplinkStats};

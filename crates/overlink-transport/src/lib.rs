//! # Overlink Transport
//!
//! Direct TCP transport provider for the Overlink overlay.
//!
//! ## Features
//!
//! - One TCP socket per message channel
//! - Length-prefixed postcard framing with a size cap
//! - Node handshake exchanging [`HandshakeInfo`](overlink_core::HandshakeInfo)
//! - Health check pings with a failure limit
//! - Clean close via goodbye frames; every channel loss reported exactly once
//!
//! ## Example
//!
//! ```rust,ignore
//! use overlink_transport::{DirectTransportProvider, DirectTransportConfig};
//! use overlink_core::{NetworkContactPoint, TransportProvider};
//!
//! let provider = DirectTransportProvider::new(context, DirectTransportConfig::default());
//!
//! // Accept inbound channels
//! let bound = provider
//!     .create_channel_endpoint(&NetworkContactPoint::any_port("direct", "127.0.0.1")?)
//!     .await?;
//!
//! // Connect to another node
//! let channel = provider.connect(&"direct:10.0.0.2:9000".parse()?).await?;
//! channel.send(payload).await?;
//! ```

pub mod connection;
pub mod error;
pub mod protocol;
pub mod provider;

// Re-export main types
pub use connection::{
    ChannelRegistry, ChannelStats, DIRECT_TRANSPORT_ID, DirectChannel, DirectTransportConfig,
};
pub use error::{FramingError, TransportError, TransportResult};
pub use protocol::{
    MAX_FRAME_SIZE, WireFrame, frame_message, parse_framed_message, read_frame, write_frame,
};
pub use provider::DirectTransportProvider;

//! # Overlink Core
//!
//! Identity model, channel abstraction and transport contract shared by
//! every Overlink crate.
//!
//! ## Key Types
//!
//! - [`InstanceNodeId`], [`InstanceNodeSessionId`], [`LogicalNodeId`]: the
//!   three-tier node identity
//! - [`NetworkContactPoint`]: where a transport can connect to
//! - [`MessageChannel`]: a duplex message pipe to one remote session
//! - [`TransportProvider`]: pluggable transport producing channels
//! - [`ChannelEventHandler`]: receives channel lifecycle events and messages
//! - [`VirtualNetwork`]: in-memory transport used for tests
//!
//! ## Errors
//!
//! [`OverlinkError`] wraps the per-concern enums ([`IdentityError`],
//! [`TransportError`], [`RoutingError`], [`RpcError`], [`UplinkError`]).

pub mod channel;
pub mod contact;
pub mod error;
pub mod event;
pub mod identity;
pub mod transport;
pub mod virtual_transport;

// Re-export main types
pub use channel::*;
pub use contact::*;
pub use error::*;
pub use event::*;
pub use identity::*;
pub use transport::*;
pub use virtual_transport::*;

//! Error types for the Overlink overlay
//!
//! Each concern gets its own enum; [`OverlinkError`] wraps all of them for
//! callers that do not care which layer failed.

use thiserror::Error;

/// Top-level error type for the Overlink overlay
#[derive(Debug, Clone, Error)]
pub enum OverlinkError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Uplink error: {0}")]
    Uplink(#[from] UplinkError),
}

/// Errors related to node identifiers and contact points
///
/// These are caller bugs and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("Malformed {kind} id: {input:?}")]
    MalformedId { kind: &'static str, input: String },

    #[error("Malformed contact point: {0}")]
    MalformedContactPoint(String),
}

/// Errors related to transport providers and message channels
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A connect attempt could not reach the contact point
    #[error("Unreachable: {contact_point}: {reason}")]
    Unreachable {
        contact_point: String,
        reason: String,
    },

    #[error("No transport provider registered for id {0:?}")]
    UnknownTransport(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Failed to create channel endpoint at {contact_point}: {reason}")]
    EndpointFailed {
        contact_point: String,
        reason: String,
    },

    #[error("Transport provider is shut down")]
    ShutDown,
}

impl TransportError {
    /// Shorthand for an [`TransportError::Unreachable`] error
    pub fn unreachable(contact_point: impl ToString, reason: impl ToString) -> Self {
        Self::Unreachable {
            contact_point: contact_point.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors related to the topology and route lookup
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// No current path from the local node to the target
    #[error("No route to {0}")]
    NoRoute(String),
}

/// Errors surfaced to the caller of a remote service invocation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("No route to {0}")]
    NoRoute(String),

    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RemoteTimeout { request_id: String, timeout_ms: u64 },

    #[error("Request {0} was cancelled")]
    Cancelled(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Method {method:?} is not remotely callable on {service}")]
    MethodNotAllowed { service: String, method: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The remote handler returned an error; carried back as data
    #[error("Remote {error_type}: {message}")]
    ServiceFailed { error_type: String, message: String },

    #[error("Forwarding failed: {0}")]
    Forwarding(String),

    #[error("Failed to send request: {0}")]
    Transport(String),

    #[error("Invalid service registration: {0}")]
    InvalidRegistration(String),
}

/// Errors related to the uplink multiplexer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UplinkError {
    /// The physical relay connection is gone; fatal to every logical channel on it
    #[error("Relay connection lost: {0}")]
    RelayConnectionLost(String),

    #[error("Uplink protocol violation: {0}")]
    Protocol(String),

    #[error("Block payload too large: {size} bytes (max {max})")]
    BlockTooLarge { size: usize, max: usize },

    #[error("No free logical channel ids")]
    ChannelIdsExhausted,

    #[error("Logical channel {0} is closed")]
    ChannelClosed(u32),

    #[error("Logical channel {channel_id} refused: {reason}")]
    ChannelRefused { channel_id: u32, reason: String },

    #[error("Uplink handshake failed: {0}")]
    Handshake(String),

    #[error("Uplink I/O error: {0}")]
    Io(String),
}

/// Result type alias using OverlinkError
pub type OverlinkResult<T> = Result<T, OverlinkError>;

/// Result type alias for identity operations
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type alias for remote invocations
pub type RpcResult<T> = Result<T, RpcError>;

/// Result type alias for uplink operations
pub type UplinkResult<T> = Result<T, UplinkError>;

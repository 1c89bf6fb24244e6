//! Error types for the node coordinator

use thiserror::Error;

use overlink_core::{IdentityError, RpcError, TransportError};
use overlink_routing::TopologyError;

/// Errors that can occur in the node coordinator
#[derive(Debug, Error)]
pub enum NodeError {
    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Topology service error
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// RPC layer error
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Malformed id or contact point
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Node already started
    #[error("Node already started")]
    AlreadyStarted,

    /// Node was shut down
    #[error("Node is shut down")]
    ShutDown,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<postcard::Error> for NodeError {
    fn from(e: postcard::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(e: toml::de::Error) -> Self {
        NodeError::Config(e.to_string())
    }
}

/// Result type alias for node operations
pub type NodeResult<T> = Result<T, NodeError>;

//! Topology error types
//!
//! Re-exports the core routing error and adds topology-specific errors.

use thiserror::Error;

use overlink_core::IdentityError;

// Re-export core routing errors
pub use overlink_core::RoutingError;

/// Errors from topology service operations
#[derive(Debug, Clone, Error)]
pub enum TopologyError {
    /// Core routing error
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// A logical node could not be derived from the local session
    #[error("Invalid logical node: {0}")]
    InvalidLogicalNode(#[from] IdentityError),

    /// The topology service already announced its shutdown
    #[error("Topology service is shut down")]
    ShutDown,
}

/// Result type for topology operations
pub type TopologyResult<T> = Result<T, TopologyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: TopologyError = RoutingError::NoRoute("abc".into()).into();
        assert_eq!(err.to_string(), "Routing error: No route to abc");
    }
}

//! RPC error types
//!
//! The error enum lives in `overlink-core` so transports and the node can
//! name it; this module re-exports it.

pub use overlink_core::{RpcError, RpcResult};

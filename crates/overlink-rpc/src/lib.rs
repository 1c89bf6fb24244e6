//! # Overlink RPC
//!
//! Remote service calls over the Overlink overlay.
//!
//! A call becomes a [`NetworkRequest`] with a fresh request id, travels hop
//! by hop to the target session and is answered with a [`NetworkResponse`]
//! carrying either the result bytes or a [`RemoteFault`]. The caller waits
//! on a per-request waiter, never longer than the call's timeout.
//!
//! ## Features
//!
//! - Static [`ServiceRegistry`] keyed by interface name, with a per-service
//!   method allow-list checked at registration
//! - [`ServiceCallDispatcher`] turning requests into responses
//! - [`PendingResponses`] correlating responses strictly by request id; late
//!   responses are counted and dropped
//! - Cancellable [`PendingCall`] handles and typed [`RemoteServiceProxy`]
//! - Multi-hop forwarding with a hop limit
//!
//! ## Example
//!
//! ```rust,ignore
//! use overlink_rpc::{RpcClient, RpcConfig, ServiceRegistry};
//!
//! let client = Arc::new(RpcClient::new(session, RpcConfig::default(), registry, router));
//! let echo = client.proxy(target, "overlink.EchoService");
//! let reply: String = echo.call("echo", "hi").await?;
//! ```

pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod pending;
pub mod proxy;
pub mod service;

// Re-export main types
pub use client::{PendingCall, RpcClient, RpcConfig, RpcRouter};
pub use dispatcher::{HANDLER_PANIC, ServiceCallDispatcher};
pub use envelope::{
    DEFAULT_HOP_LIMIT, NetworkRequest, NetworkResponse, RemoteFault, ResponseBody, RpcMessage,
};
pub use error::{RpcError, RpcResult};
pub use pending::{PendingResponses, PendingStats};
pub use proxy::RemoteServiceProxy;
pub use service::{CallContext, RemoteService, ServiceRegistry, decode_args, encode_value};

//! Built-in echo service
//!
//! Answers `echo` with its argument bytes unchanged, which makes it a
//! reachability check for any payload type.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use overlink_core::{NodeIdentifier, RpcError, RpcResult};
use overlink_rpc::{CallContext, RemoteService, RemoteServiceProxy};

/// Interface name of the echo service
pub const ECHO_SERVICE: &str = "overlink.EchoService";

pub struct EchoService;

#[async_trait]
impl RemoteService for EchoService {
    fn interface_name(&self) -> &str {
        ECHO_SERVICE
    }

    fn remote_methods(&self) -> &[&'static str] {
        &["echo"]
    }

    async fn invoke(&self, ctx: &CallContext, method: &str, args: Bytes) -> RpcResult<Bytes> {
        match method {
            "echo" => {
                trace!(caller = %ctx.caller.short_id(), bytes = args.len(), "Echo");
                Ok(args)
            }
            other => Err(RpcError::MethodNotAllowed {
                service: ECHO_SERVICE.into(),
                method: other.into(),
            }),
        }
    }
}

/// Typed client of a remote [`EchoService`]
#[derive(Debug, Clone)]
pub struct EchoServiceProxy {
    inner: RemoteServiceProxy,
}

impl EchoServiceProxy {
    pub fn new(inner: RemoteServiceProxy) -> Self {
        Self { inner }
    }

    pub async fn echo(&self, text: &str) -> RpcResult<String> {
        self.inner.call("echo", text).await
    }

    pub async fn echo_bytes(&self, data: Bytes) -> RpcResult<Bytes> {
        self.inner.call_raw("echo", data).await
    }

    pub fn proxy(&self) -> &RemoteServiceProxy {
        &self.inner
    }
}

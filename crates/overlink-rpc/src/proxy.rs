//! Typed stand-in for a remote service

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use overlink_core::{LogicalNodeId, RpcResult};

use crate::client::RpcClient;
use crate::service::{decode_args, encode_value};

/// Calls methods of one service on one remote logical node
#[derive(Clone)]
pub struct RemoteServiceProxy {
    client: Arc<RpcClient>,
    target: LogicalNodeId,
    service: String,
    timeout: Option<Duration>,
}

impl RemoteServiceProxy {
    pub fn new(client: Arc<RpcClient>, target: LogicalNodeId, service: impl Into<String>) -> Self {
        Self {
            client,
            target,
            service: service.into(),
            timeout: None,
        }
    }

    /// Override the client's default timeout for calls through this proxy
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn target(&self) -> &LogicalNodeId {
        &self.target
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Call with raw argument and result bytes
    pub async fn call_raw(&self, method: &str, args: Bytes) -> RpcResult<Bytes> {
        let timeout = self
            .timeout
            .unwrap_or_else(|| self.client.config().default_timeout());
        self.client
            .invoke_with_timeout(&self.target, &self.service, method, args, timeout)
            .await
    }

    /// Call with postcard-encoded argument and result
    pub async fn call<A, R>(&self, method: &str, args: &A) -> RpcResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let result = self.call_raw(method, encode_value(args)?).await?;
        decode_args(&result)
    }
}

impl std::fmt::Debug for RemoteServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServiceProxy")
            .field("target", &self.target)
            .field("service", &self.service)
            .finish()
    }
}

//! Outgoing calls and message handling
//!
//! [`RpcClient`] sends requests toward their target through an
//! [`RpcRouter`], waits for the matching response and serves or forwards
//! incoming RPC messages. Every wait is bounded by a timeout.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use overlink_core::{InstanceNodeSessionId, LogicalNodeId, NodeIdentifier, RpcError, RpcResult};

use crate::dispatcher::ServiceCallDispatcher;
use crate::envelope::{NetworkRequest, NetworkResponse, RemoteFault, RpcMessage};
use crate::pending::{PendingResponses, PendingStats};
use crate::proxy::RemoteServiceProxy;
use crate::service::{ServiceRegistry, decode_args, encode_value};

/// RPC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Timeout for calls that do not set their own, in milliseconds
    pub default_timeout_ms: u64,
    /// Hop limit stamped on new requests and responses
    pub hop_limit: u8,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            hop_limit: crate::envelope::DEFAULT_HOP_LIMIT,
        }
    }
}

impl RpcConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_hop_limit(mut self, hop_limit: u8) -> Self {
        self.hop_limit = hop_limit;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Moves RPC messages one hop closer to their destination
#[async_trait]
pub trait RpcRouter: Send + Sync + 'static {
    /// Send `message` to the next hop toward `target`
    ///
    /// Fails with [`RpcError::NoRoute`] if `target` is not reachable.
    async fn send_toward(&self, target: &InstanceNodeSessionId, message: RpcMessage) -> RpcResult<()>;
}

/// Client side and serving side of the RPC layer for one session
pub struct RpcClient {
    local: LogicalNodeId,
    config: RpcConfig,
    pending: Arc<PendingResponses>,
    dispatcher: Arc<ServiceCallDispatcher>,
    router: Arc<dyn RpcRouter>,
}

impl RpcClient {
    pub fn new(
        local: InstanceNodeSessionId,
        config: RpcConfig,
        registry: Arc<ServiceRegistry>,
        router: Arc<dyn RpcRouter>,
    ) -> Self {
        let local = local.default_logical_node_id();
        let dispatcher = Arc::new(ServiceCallDispatcher::new(registry, local.clone()));
        Self {
            local,
            config,
            pending: Arc::new(PendingResponses::new()),
            dispatcher,
            router,
        }
    }

    pub fn local_node(&self) -> &LogicalNodeId {
        &self.local
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.dispatcher.registry()
    }

    pub fn stats(&self) -> PendingStats {
        self.pending.stats()
    }

    /// Call `service.method` on `target` with the default timeout
    pub async fn invoke(
        &self,
        target: &LogicalNodeId,
        service: &str,
        method: &str,
        args: Bytes,
    ) -> RpcResult<Bytes> {
        self.invoke_with_timeout(target, service, method, args, self.config.default_timeout())
            .await
    }

    pub async fn invoke_with_timeout(
        &self,
        target: &LogicalNodeId,
        service: &str,
        method: &str,
        args: Bytes,
        timeout: Duration,
    ) -> RpcResult<Bytes> {
        self.start_invoke(target, service, method, args, timeout)
            .await?
            .await
    }

    /// Call with postcard-encoded arguments and result
    pub async fn invoke_typed<A, R>(
        &self,
        target: &LogicalNodeId,
        service: &str,
        method: &str,
        args: &A,
    ) -> RpcResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = encode_value(args)?;
        let result = self.invoke(target, service, method, args).await?;
        decode_args(&result)
    }

    /// Send a request and return a handle to its pending result
    ///
    /// Fails right away with [`RpcError::NoRoute`] if the target is not
    /// reachable. Dropping the handle cancels the call.
    #[instrument(skip(self, args), fields(
        target = %target.short_id(),
        service = %service,
        method = %method,
    ))]
    pub async fn start_invoke(
        &self,
        target: &LogicalNodeId,
        service: &str,
        method: &str,
        args: Bytes,
        timeout: Duration,
    ) -> RpcResult<PendingCall> {
        let target_session = target.session_id();
        let request = NetworkRequest::new(
            self.local.clone(),
            target_session.clone(),
            service,
            method,
            args,
        )
        .with_hop_limit(self.config.hop_limit);
        let request_id = request.request_id;
        let receiver = self.pending.register(request_id);
        let call = PendingCall {
            request_id,
            timeout,
            receiver,
            pending: Arc::clone(&self.pending),
        };

        if target_session == self.local.session_id() {
            debug!(%request_id, "Dispatching local call");
            let dispatcher = Arc::clone(&self.dispatcher);
            let pending = Arc::clone(&self.pending);
            tokio::spawn(async move {
                let response = dispatcher.dispatch(&request).await;
                pending.complete(response);
            });
            return Ok(call);
        }

        // The waiter is in place before the request leaves, so even an
        // immediate response finds it. On failure dropping `call` removes it.
        self.router
            .send_toward(&target_session, RpcMessage::Request(request))
            .await?;
        debug!(%request_id, "Request sent");
        Ok(call)
    }

    /// Typed proxy for one service on `target`
    pub fn proxy(self: &Arc<Self>, target: LogicalNodeId, service: impl Into<String>) -> RemoteServiceProxy {
        RemoteServiceProxy::new(Arc::clone(self), target, service)
    }

    /// Handle an RPC message received from a neighbour
    ///
    /// Requests for this session are served and answered; messages for
    /// other sessions are forwarded; responses go to their waiter.
    pub async fn handle_message(&self, message: RpcMessage) {
        let destination = message.destination();
        if destination != self.local.session_id() {
            self.forward(destination, message).await;
            return;
        }

        match message {
            RpcMessage::Request(request) => {
                let response = self.dispatcher.dispatch(&request).await;
                self.reply(response).await;
            }
            RpcMessage::Response(response) => {
                self.pending.complete(response);
            }
        }
    }

    async fn forward(&self, destination: InstanceNodeSessionId, mut message: RpcMessage) {
        let request_id = message.request_id();
        let failure = if !message.take_hop() {
            RpcError::Forwarding(format!("hop limit exceeded toward {destination}"))
        } else {
            match self.router.send_toward(&destination, message.clone()).await {
                Ok(()) => {
                    debug!(%request_id, to = %destination.short_id(), "Forwarded RPC message");
                    return;
                }
                Err(e) => e,
            }
        };

        warn!(%request_id, to = %destination.short_id(), error = %failure, "Cannot forward RPC message");
        // A request that cannot travel on is answered here; a lost response
        // is left to the caller's timeout
        if let RpcMessage::Request(request) = message {
            let response = request.fail(self.local.clone(), RemoteFault::from_error(failure));
            self.reply(response).await;
        }
    }

    async fn reply(&self, mut response: NetworkResponse) {
        response.hop_limit = self.config.hop_limit;
        let receiver = response.receiver.session_id();
        let request_id = response.request_id;
        if receiver == self.local.session_id() {
            self.pending.complete(response);
            return;
        }
        if let Err(e) = self
            .router
            .send_toward(&receiver, RpcMessage::Response(response))
            .await
        {
            warn!(%request_id, to = %receiver.short_id(), error = %e, "Dropping response");
        }
    }

    /// Fail every outstanding call, used on shutdown
    pub fn cancel_all(&self) -> usize {
        self.pending.clear()
    }
}

/// An in-flight call
///
/// Await it for the result. Cancelling or dropping it removes the waiter;
/// a response arriving afterwards is discarded.
#[must_use = "dropping a PendingCall cancels it"]
pub struct PendingCall {
    request_id: Uuid,
    timeout: Duration,
    receiver: oneshot::Receiver<NetworkResponse>,
    pending: Arc<PendingResponses>,
}

impl PendingCall {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Give up on the call
    pub fn cancel(self) {
        if self.pending.remove(&self.request_id) {
            debug!(request_id = %self.request_id, "Call cancelled");
        }
    }

    /// Wait for the response or the timeout
    pub async fn wait(mut self) -> RpcResult<Bytes> {
        match tokio::time::timeout(self.timeout, &mut self.receiver).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(RpcError::Cancelled(self.request_id.to_string())),
            Err(_) => {
                self.pending.remove(&self.request_id);
                warn!(
                    request_id = %self.request_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Call timed out"
                );
                Err(RpcError::RemoteTimeout {
                    request_id: self.request_id.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl IntoFuture for PendingCall {
    type Output = RpcResult<Bytes>;
    type IntoFuture = Pin<Box<dyn Future<Output = RpcResult<Bytes>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("request_id", &self.request_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

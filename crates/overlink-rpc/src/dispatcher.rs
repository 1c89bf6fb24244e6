//! Serving incoming requests from the local service table

use std::sync::Arc;

use tokio::task::JoinError;
use tracing::{debug, error, instrument, warn};

use overlink_core::LogicalNodeId;

use crate::envelope::{NetworkRequest, NetworkResponse, RemoteFault};
use crate::service::{CallContext, ServiceRegistry};

/// Turns requests into responses using the registered services
pub struct ServiceCallDispatcher {
    registry: Arc<ServiceRegistry>,
    local: LogicalNodeId,
}

impl ServiceCallDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, local: LogicalNodeId) -> Self {
        Self { registry, local }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Run one request; failures become faults in the response
    #[instrument(skip(self, request), fields(
        request_id = %request.request_id,
        service = %request.service,
        method = %request.method,
    ))]
    pub async fn dispatch(&self, request: &NetworkRequest) -> NetworkResponse {
        let service = match self.registry.resolve(&request.service, &request.method) {
            Ok(service) => service,
            Err(e) => {
                debug!(error = %e, "Rejecting call");
                return request.fail(self.local.clone(), RemoteFault::from_error(e));
            }
        };

        let ctx = CallContext {
            request_id: request.request_id,
            caller: request.sender.clone(),
        };
        let method = request.method.clone();
        let args = request.args.clone();
        // Own task so a panicking handler still gets an answer back
        let handler = tokio::spawn(async move { service.invoke(&ctx, &method, args).await });
        match handler.await {
            Ok(Ok(result)) => {
                debug!(bytes = result.len(), "Call served");
                request.respond(self.local.clone(), result)
            }
            Ok(Err(e)) => {
                warn!(error = %e, caller = %request.sender, "Service call failed");
                request.fail(self.local.clone(), RemoteFault::from_error(e))
            }
            Err(e) => {
                let message = panic_message(e);
                error!(caller = %request.sender, panic = %message, "Service handler panicked");
                request.fail(
                    self.local.clone(),
                    RemoteFault::ServiceError {
                        error_type: HANDLER_PANIC.into(),
                        message,
                    },
                )
            }
        }
    }
}

/// Fault type reported when a handler panics or is aborted
pub const HANDLER_PANIC: &str = "HandlerPanic";

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "handler panicked".to_string()
    }
}

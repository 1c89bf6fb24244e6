//! Remotely callable services and the static service table
//!
//! A service names its interface and lists the methods remote callers may
//! reach. The list is checked once when the service is registered and
//! again for every incoming call.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;
use uuid::Uuid;

use overlink_core::{LogicalNodeId, RpcError, RpcResult};

/// Information about the call being served
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: Uuid,
    pub caller: LogicalNodeId,
}

/// A service that remote nodes can invoke
#[async_trait]
pub trait RemoteService: Send + Sync + 'static {
    /// Interface name callers address, e.g. `overlink.EchoService`
    fn interface_name(&self) -> &str;

    /// Methods reachable by remote callers
    fn remote_methods(&self) -> &[&'static str];

    /// Handle one call of an allowed method
    ///
    /// Errors are sent back to the caller; use [`RpcError::ServiceFailed`]
    /// for application errors.
    async fn invoke(&self, ctx: &CallContext, method: &str, args: Bytes) -> RpcResult<Bytes>;
}

/// Decode postcard-encoded call arguments
pub fn decode_args<T: DeserializeOwned>(args: &[u8]) -> RpcResult<T> {
    postcard::from_bytes(args).map_err(|e| RpcError::Serialization(e.to_string()))
}

/// Encode a value with postcard for the wire
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> RpcResult<Bytes> {
    postcard::to_allocvec(value)
        .map(Bytes::from)
        .map_err(|e| RpcError::Serialization(e.to_string()))
}

struct RegisteredService {
    service: Arc<dyn RemoteService>,
    methods: HashSet<String>,
}

/// Static table of local services keyed by interface name
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, RegisteredService>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service
    ///
    /// Fails if the interface name is taken or empty, or if the method
    /// allow-list is empty or contains duplicates.
    pub fn register(&self, service: Arc<dyn RemoteService>) -> RpcResult<()> {
        let name = service.interface_name().to_string();
        if name.is_empty() {
            return Err(RpcError::InvalidRegistration(
                "empty interface name".into(),
            ));
        }

        let declared = service.remote_methods();
        if declared.is_empty() {
            return Err(RpcError::InvalidRegistration(format!(
                "{name} exposes no remote methods"
            )));
        }
        let mut methods = HashSet::with_capacity(declared.len());
        for method in declared {
            if method.is_empty() || !methods.insert(method.to_string()) {
                return Err(RpcError::InvalidRegistration(format!(
                    "{name} declares invalid or duplicate method {method:?}"
                )));
            }
        }

        match self.services.entry(name.clone()) {
            Entry::Occupied(_) => Err(RpcError::InvalidRegistration(format!(
                "{name} is already registered"
            ))),
            Entry::Vacant(slot) => {
                info!(service = %name, methods = methods.len(), "Service registered");
                slot.insert(RegisteredService { service, methods });
                Ok(())
            }
        }
    }

    pub fn unregister(&self, interface_name: &str) -> bool {
        self.services.remove(interface_name).is_some()
    }

    /// Look up a service and check that `method` is on its allow-list
    pub fn resolve(&self, interface_name: &str, method: &str) -> RpcResult<Arc<dyn RemoteService>> {
        let entry = self
            .services
            .get(interface_name)
            .ok_or_else(|| RpcError::ServiceNotFound(interface_name.to_string()))?;
        if !entry.methods.contains(method) {
            return Err(RpcError::MethodNotAllowed {
                service: interface_name.to_string(),
                method: method.to_string(),
            });
        }
        Ok(Arc::clone(&entry.service))
    }

    pub fn contains(&self, interface_name: &str) -> bool {
        self.services.contains_key(interface_name)
    }

    /// Registered interface names, sorted
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

//! Request and response envelopes
//!
//! Both travel as [`RpcMessage`] values encoded with postcard. Arguments and
//! results are opaque bytes; the envelope only carries routing and
//! correlation metadata.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use overlink_core::{InstanceNodeSessionId, LogicalNodeId, RpcError, RpcResult};

/// Hops a request may take before it is answered with a forwarding fault
pub const DEFAULT_HOP_LIMIT: u8 = 16;

/// A remote call on its way to the target node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub request_id: Uuid,
    /// Logical node of the caller; responses are routed back to its session
    pub sender: LogicalNodeId,
    pub target: InstanceNodeSessionId,
    pub service: String,
    pub method: String,
    pub args: Bytes,
    /// Creation time, milliseconds since the Unix epoch
    pub timestamp_millis: i64,
    pub hop_limit: u8,
}

impl NetworkRequest {
    pub fn new(
        sender: LogicalNodeId,
        target: InstanceNodeSessionId,
        service: impl Into<String>,
        method: impl Into<String>,
        args: Bytes,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            sender,
            target,
            service: service.into(),
            method: method.into(),
            args,
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            hop_limit: DEFAULT_HOP_LIMIT,
        }
    }

    pub fn with_hop_limit(mut self, hop_limit: u8) -> Self {
        self.hop_limit = hop_limit;
        self
    }

    /// Successful response to this request
    pub fn respond(&self, responder: LogicalNodeId, result: Bytes) -> NetworkResponse {
        self.response(responder, ResponseBody::Success(result))
    }

    /// Failed response to this request
    pub fn fail(&self, responder: LogicalNodeId, fault: RemoteFault) -> NetworkResponse {
        self.response(responder, ResponseBody::Fault(fault))
    }

    fn response(&self, responder: LogicalNodeId, body: ResponseBody) -> NetworkResponse {
        NetworkResponse {
            request_id: self.request_id,
            sender: responder,
            receiver: self.sender.clone(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            hop_limit: DEFAULT_HOP_LIMIT,
            body,
        }
    }
}

/// Result envelope, correlated strictly by `request_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResponse {
    pub request_id: Uuid,
    /// Node that produced the response
    pub sender: LogicalNodeId,
    /// Caller the response is routed to
    pub receiver: LogicalNodeId,
    pub timestamp_millis: i64,
    pub hop_limit: u8,
    pub body: ResponseBody,
}

impl NetworkResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.body, ResponseBody::Success(_))
    }

    /// The result bytes, or the fault re-raised as an [`RpcError`]
    pub fn into_result(self) -> RpcResult<Bytes> {
        match self.body {
            ResponseBody::Success(bytes) => Ok(bytes),
            ResponseBody::Fault(fault) => Err(fault.into()),
        }
    }
}

/// Serialized result or fault marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    Success(Bytes),
    Fault(RemoteFault),
}

/// Failure carried as data in a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteFault {
    ServiceNotFound { service: String },
    MethodNotAllowed { service: String, method: String },
    Serialization { message: String },
    /// The service handler returned an error
    ServiceError { error_type: String, message: String },
    /// An intermediate node could not pass the message on
    Forwarding { message: String },
}

impl RemoteFault {
    /// Convert an error raised while dispatching into a fault
    pub fn from_error(error: RpcError) -> Self {
        match error {
            RpcError::ServiceNotFound(service) => Self::ServiceNotFound { service },
            RpcError::MethodNotAllowed { service, method } => {
                Self::MethodNotAllowed { service, method }
            }
            RpcError::Serialization(message) => Self::Serialization { message },
            RpcError::ServiceFailed {
                error_type,
                message,
            } => Self::ServiceError {
                error_type,
                message,
            },
            RpcError::Forwarding(message) | RpcError::NoRoute(message) => {
                Self::Forwarding { message }
            }
            other => Self::ServiceError {
                error_type: "RpcError".into(),
                message: other.to_string(),
            },
        }
    }
}

impl From<RemoteFault> for RpcError {
    fn from(fault: RemoteFault) -> Self {
        match fault {
            RemoteFault::ServiceNotFound { service } => RpcError::ServiceNotFound(service),
            RemoteFault::MethodNotAllowed { service, method } => {
                RpcError::MethodNotAllowed { service, method }
            }
            RemoteFault::Serialization { message } => RpcError::Serialization(message),
            RemoteFault::ServiceError {
                error_type,
                message,
            } => RpcError::ServiceFailed {
                error_type,
                message,
            },
            RemoteFault::Forwarding { message } => RpcError::Forwarding(message),
        }
    }
}

/// Everything the RPC layer puts on a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMessage {
    Request(NetworkRequest),
    Response(NetworkResponse),
}

impl RpcMessage {
    pub fn encode(&self) -> RpcResult<Bytes> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(|e| RpcError::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> RpcResult<Self> {
        postcard::from_bytes(data).map_err(|e| RpcError::Serialization(e.to_string()))
    }

    /// Session the message must reach
    pub fn destination(&self) -> InstanceNodeSessionId {
        match self {
            RpcMessage::Request(request) => request.target.clone(),
            RpcMessage::Response(response) => response.receiver.session_id(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            RpcMessage::Request(request) => request.request_id,
            RpcMessage::Response(response) => response.request_id,
        }
    }

    /// Consume one hop; false once the limit is exhausted
    pub fn take_hop(&mut self) -> bool {
        let hop_limit = match self {
            RpcMessage::Request(request) => &mut request.hop_limit,
            RpcMessage::Response(response) => &mut response.hop_limit,
        };
        if *hop_limit == 0 {
            return false;
        }
        *hop_limit -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use overlink_core::InstanceNodeId;

    use super::*;

    fn request(args: Bytes) -> NetworkRequest {
        let caller = InstanceNodeId::generate().new_session();
        let target = InstanceNodeId::generate().new_session();
        NetworkRequest::new(
            caller.default_logical_node_id(),
            target,
            "overlink.EchoService",
            "echo",
            args,
        )
    }

    #[test]
    fn test_request_roundtrip_empty_and_large() {
        for args in [Bytes::new(), Bytes::from(vec![0xAB; 1024 * 1024 + 7])] {
            let message = RpcMessage::Request(request(args));
            let decoded = RpcMessage::decode(&message.encode().unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let req = request(Bytes::from_static(b"hi"));
        let responder = req.target.default_logical_node_id();

        let ok = RpcMessage::Response(req.respond(responder.clone(), Bytes::from_static(b"hi")));
        assert_eq!(RpcMessage::decode(&ok.encode().unwrap()).unwrap(), ok);

        let fault = RpcMessage::Response(req.fail(
            responder,
            RemoteFault::ServiceError {
                error_type: "EchoError".into(),
                message: "boom".into(),
            },
        ));
        assert_eq!(RpcMessage::decode(&fault.encode().unwrap()).unwrap(), fault);
        assert_eq!(fault.destination(), req.sender.session_id());
        assert_eq!(fault.request_id(), req.request_id);
    }

    #[test]
    fn test_request_ids_unique() {
        let a = request(Bytes::new());
        let b = request(Bytes::new());
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_fault_maps_to_error() {
        let req = request(Bytes::new());
        let responder = req.target.default_logical_node_id();
        let response = req.fail(
            responder,
            RemoteFault::MethodNotAllowed {
                service: "svc".into(),
                method: "secret".into(),
            },
        );
        assert!(!response.is_success());
        assert_eq!(
            response.into_result(),
            Err(RpcError::MethodNotAllowed {
                service: "svc".into(),
                method: "secret".into()
            })
        );

        let fault = RemoteFault::from_error(RpcError::ServiceNotFound("x".into()));
        assert_eq!(RpcError::from(fault), RpcError::ServiceNotFound("x".into()));
    }

    #[test]
    fn test_hop_limit() {
        let mut message = RpcMessage::Request(request(Bytes::new()).with_hop_limit(1));
        assert!(message.take_hop());
        assert!(!message.take_hop());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            RpcMessage::decode(&[0xFF, 0xFF, 0xFF]),
            Err(RpcError::Serialization(_))
        ));
    }
}

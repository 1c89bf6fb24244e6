//! Control payloads carried in HANDSHAKE and CHANNEL_OPEN blocks

use serde::{Deserialize, Serialize};

use overlink_core::{UplinkError, UplinkResult};

/// Version spoken by this implementation
pub const UPLINK_PROTOCOL_VERSION: u32 = 1;

/// Payload of the HANDSHAKE block on the default channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkHandshake {
    pub protocol_version: u32,
    pub node_name: String,
    /// Namespace the sender wants to be reachable under through a relay
    pub namespace: Option<String>,
}

impl UplinkHandshake {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            protocol_version: UPLINK_PROTOCOL_VERSION,
            node_name: node_name.into(),
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }
}

/// Role of one side of an execution channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionRole {
    Initiator,
    Provider,
}

impl ExecutionRole {
    /// The role the other side takes
    pub fn counterpart(self) -> Self {
        match self {
            ExecutionRole::Initiator => ExecutionRole::Provider,
            ExecutionRole::Provider => ExecutionRole::Initiator,
        }
    }
}

/// What a logical channel is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// The default channel 0; never requested through CHANNEL_OPEN
    Control,
    /// One execution session; `role` is the opener's role
    Execution { role: ExecutionRole },
    FileTransfer,
    /// Node messages of the uplink transport provider
    Messaging,
}

/// Payload of a CHANNEL_OPEN block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOpenRequest {
    pub kind: ChannelKind,
    pub label: String,
    /// `namespace` or `namespace/...` of the session a relay should
    /// forward the channel to; `None` ends the channel at the peer
    pub destination: Option<String>,
}

impl ChannelOpenRequest {
    pub fn new(kind: ChannelKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            destination: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Separates the namespace from the rest of a destination id
pub const DESTINATION_SEPARATOR: char = '/';

/// Namespace part of a destination id
pub fn destination_namespace(destination: &str) -> &str {
    destination
        .split_once(DESTINATION_SEPARATOR)
        .map_or(destination, |(namespace, _)| namespace)
}

/// Whether `destination` addresses `namespace`
///
/// Matches the namespace itself or anything below it; `relay-a` does not
/// match `relay-ab/x`.
pub fn destination_matches(namespace: &str, destination: &str) -> bool {
    !namespace.is_empty() && destination_namespace(destination) == namespace
}

pub(crate) fn encode_control<T: Serialize>(value: &T) -> UplinkResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| UplinkError::Protocol(e.to_string()))
}

pub(crate) fn decode_control<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> UplinkResult<T> {
    postcard::from_bytes(payload).map_err(|e| UplinkError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_request_roundtrip() {
        let request = ChannelOpenRequest::new(
            ChannelKind::Execution {
                role: ExecutionRole::Initiator,
            },
            "component-run-17",
        )
        .with_destination("site-a/worker");
        let decoded: ChannelOpenRequest = decode_control(&encode_control(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_destination_prefix_needs_separator() {
        assert!(destination_matches("site-a", "site-a"));
        assert!(destination_matches("site-a", "site-a/node"));
        assert!(destination_matches("site-a", "site-a/node/deeper"));
        assert!(!destination_matches("site-a", "site-ab/node"));
        assert!(!destination_matches("site-a", "site/a"));
        assert!(!destination_matches("", "/node"));
        assert_eq!(destination_namespace("x/y/z"), "x");
    }

    #[test]
    fn test_handshake_carries_namespace() {
        let hello = UplinkHandshake::new("worker").with_namespace(Some("site-a".into()));
        let decoded: UplinkHandshake = decode_control(&encode_control(&hello).unwrap()).unwrap();
        assert_eq!(decoded.namespace.as_deref(), Some("site-a"));
    }

    #[test]
    fn test_counterpart() {
        assert_eq!(ExecutionRole::Initiator.counterpart(), ExecutionRole::Provider);
        assert_eq!(ExecutionRole::Provider.counterpart(), ExecutionRole::Initiator);
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        assert!(matches!(
            decode_control::<UplinkHandshake>(&[0xFF; 3]),
            Err(UplinkError::Protocol(_))
        ));
    }
}

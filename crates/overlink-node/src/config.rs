//! Configuration for the node coordinator
//!
//! Everything has a default, so a TOML file only needs the values that
//! differ:
//!
//! ```toml
//! display_name = "relay-a"
//! listen = ["direct:0.0.0.0:9000"]
//! connect = ["direct:10.0.0.7:9000"]
//! relays = ["uplink:relay.example:7000"]
//!
//! [uplink]
//! namespace = "site-a"
//!
//! [rpc]
//! default_timeout_ms = 5000
//!
//! [[logical_nodes]]
//! logical_part = "1"
//! display_name = "worker"
//! capabilities = ["compute"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use overlink_core::{InstanceNodeId, NetworkContactPoint};
use overlink_logging::LogConfig;
use overlink_routing::TopologyConfig;
use overlink_rpc::RpcConfig;
use overlink_transport::DirectTransportConfig;
use overlink_uplink::UplinkConfig;

use crate::error::{NodeError, NodeResult};

/// A logical node announced when the node starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalNodeConfig {
    pub logical_part: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Configuration for an OverlinkNode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name announced in handshakes and advertisements
    pub display_name: String,
    /// Stable installation id; a fresh one is generated when unset
    pub instance_id: Option<String>,
    /// Contact points to listen on, e.g. `direct:0.0.0.0:9000`
    pub listen: Vec<String>,
    /// Contact points to connect to after starting
    pub connect: Vec<String>,
    /// Uplink relays to stay attached to, so peers can reach this node
    /// under `uplink.namespace`
    pub relays: Vec<String>,
    /// Register the built-in echo service
    pub echo_service: bool,
    pub logical_nodes: Vec<LogicalNodeConfig>,
    pub direct: DirectTransportConfig,
    pub uplink: UplinkConfig,
    pub rpc: RpcConfig,
    pub topology: TopologyConfig,
    pub logging: LogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: "overlink-node".into(),
            instance_id: None,
            listen: Vec::new(),
            connect: Vec::new(),
            relays: Vec::new(),
            echo_service: true,
            logical_nodes: Vec::new(),
            direct: DirectTransportConfig::default(),
            uplink: UplinkConfig::default(),
            rpc: RpcConfig::default(),
            topology: TopologyConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> NodeResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_instance_id(mut self, id: &InstanceNodeId) -> Self {
        self.instance_id = Some(id.to_string());
        self
    }

    pub fn with_listen(mut self, contact_point: impl ToString) -> Self {
        self.listen.push(contact_point.to_string());
        self
    }

    pub fn with_connect(mut self, contact_point: impl ToString) -> Self {
        self.connect.push(contact_point.to_string());
        self
    }

    pub fn with_relay(mut self, contact_point: impl ToString) -> Self {
        self.relays.push(contact_point.to_string());
        self
    }

    pub fn with_echo_service(mut self, enabled: bool) -> Self {
        self.echo_service = enabled;
        self
    }

    pub fn with_logical_node(mut self, logical_node: LogicalNodeConfig) -> Self {
        self.logical_nodes.push(logical_node);
        self
    }

    pub fn with_direct(mut self, direct: DirectTransportConfig) -> Self {
        self.direct = direct;
        self
    }

    pub fn with_uplink(mut self, uplink: UplinkConfig) -> Self {
        self.uplink = uplink;
        self
    }

    pub fn with_rpc(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc = self.rpc.with_default_timeout(timeout);
        self
    }

    pub fn with_topology(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_logging(mut self, logging: LogConfig) -> Self {
        self.logging = logging;
        self
    }

    /// The configured installation id, or a fresh one
    pub fn instance_node_id(&self) -> NodeResult<InstanceNodeId> {
        match &self.instance_id {
            Some(id) => Ok(InstanceNodeId::parse(id)?),
            None => Ok(InstanceNodeId::generate()),
        }
    }

    pub fn listen_points(&self) -> NodeResult<Vec<NetworkContactPoint>> {
        parse_contact_points(&self.listen)
    }

    pub fn connect_points(&self) -> NodeResult<Vec<NetworkContactPoint>> {
        parse_contact_points(&self.connect)
    }

    pub fn relay_points(&self) -> NodeResult<Vec<NetworkContactPoint>> {
        parse_contact_points(&self.relays)
    }
}

fn parse_contact_points(raw: &[String]) -> NodeResult<Vec<NetworkContactPoint>> {
    raw.iter()
        .map(|s| s.parse::<NetworkContactPoint>().map_err(NodeError::from))
        .collect()
}

//! # Overlink Routing
//!
//! Topology layer for the Overlink overlay.
//!
//! Every node floods a link-state advertisement describing its own channels
//! and logical nodes. The [`TopologyService`] keeps the newest advertisement
//! of the newest session per installation, forgets advertisements whose owner
//! stayed unreachable for a while, and rebuilds an immutable [`NetworkGraph`] after each change.
//!
//! ## Core Components
//!
//! - [`NetworkGraph`]: reachable nodes, deduplicated links and shortest routes
//! - [`LinkStateAdvertisement`]: a node's description of itself
//! - [`LinkStateDatabase`]: newest advertisement per session
//! - [`TopologyService`]: single writer publishing snapshots and diffs
//! - [`TopologyListener`]: callback interface for topology changes
//!
//! ## Routing Algorithm
//!
//! Routes are shortest paths by hop count from the local node. When several
//! shortest paths exist, the one whose first hop has the lexicographically
//! smallest session id wins. Parallel links between the same two nodes are
//! reduced to the lowest-latency one, then the earliest established.
//!
//! ## Example
//!
//! ```rust,ignore
//! use overlink_routing::{TopologyConfig, TopologyService};
//!
//! let topology = TopologyService::new(local_session, "node-a", TopologyConfig::default());
//!
//! // Feed channel events and flood the returned advertisement
//! let lsa = topology.on_link_established(channel_id, remote_session, 0)?;
//!
//! // Route a message
//! let next_hop = topology.next_hop(&target)?;
//! ```

pub mod error;
pub mod graph;
pub mod link_state;
pub mod topology;

// Re-export main types
pub use error::{RoutingError, TopologyError, TopologyResult};
pub use graph::{GraphDiff, LinkDescriptor, LogicalNodeInfo, NetworkGraph, NodeProperties, Route};
pub use link_state::{
    AdvertisedLink, AdvertisementReason, ApplyOutcome, LinkStateAdvertisement, LinkStateDatabase,
    LogicalNodeAdvertisement, SessionRank,
};
pub use topology::{TopologyConfig, TopologyListener, TopologyService};

//! Immutable network graph snapshots
//!
//! A [`NetworkGraph`] is built once from a set of links and never mutated.
//! Building it deduplicates links, runs a breadth-first search from the
//! local node and keeps only the reachable part, so every link in a
//! snapshot references nodes that are in the snapshot.
//!
//! Routes use hop count as weight. Among equally short paths the one with
//! the lexicographically smallest first hop wins.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use overlink_core::{InstanceNodeSessionId, LogicalNodeId, NodeIdentifier};

/// A directed link between two sessions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkDescriptor {
    pub link_id: String,
    pub source: InstanceNodeSessionId,
    pub target: InstanceNodeSessionId,
    pub latency_ms: u32,
    /// Lower means established earlier
    pub established_seq: u64,
}

impl LinkDescriptor {
    /// Preference order among parallel links: latency, then age, then id
    fn preference_key(&self) -> (u32, u64, &str) {
        (self.latency_ms, self.established_seq, &self.link_id)
    }
}

/// Metadata of one logical node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicalNodeInfo {
    pub display_name: String,
    pub capabilities: BTreeSet<String>,
}

/// Metadata a session advertises about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeProperties {
    pub display_name: String,
    /// Keyed by logical part
    pub logical_nodes: BTreeMap<String, LogicalNodeInfo>,
}

/// Shortest path information for one reachable node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// First node after the local node; the target itself for neighbours
    pub next_hop: InstanceNodeSessionId,
    pub hop_count: u32,
    /// Node before the target on the chosen path
    pub predecessor: InstanceNodeSessionId,
}

/// Difference between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphDiff {
    pub added: BTreeSet<InstanceNodeSessionId>,
    pub removed: BTreeSet<InstanceNodeSessionId>,
    /// True if nodes, links or node metadata differ
    pub topology_changed: bool,
}

impl GraphDiff {
    pub fn reachability_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Consistent view of the reachable overlay
#[derive(Debug, Clone)]
pub struct NetworkGraph {
    version: u64,
    local: InstanceNodeSessionId,
    nodes: BTreeSet<InstanceNodeSessionId>,
    links: BTreeSet<LinkDescriptor>,
    properties: BTreeMap<InstanceNodeSessionId, NodeProperties>,
    routes: BTreeMap<InstanceNodeSessionId, Route>,
}

impl NetworkGraph {
    /// A graph containing only the local node
    pub fn empty(local: InstanceNodeSessionId) -> Self {
        Self::build(local, std::iter::empty(), BTreeMap::new(), 0)
    }

    /// Compute a snapshot from the complete known link set
    pub fn build<I>(
        local: InstanceNodeSessionId,
        links: I,
        mut properties: BTreeMap<InstanceNodeSessionId, NodeProperties>,
        version: u64,
    ) -> Self
    where
        I: IntoIterator<Item = LinkDescriptor>,
    {
        let deduped = deduplicate(links);

        let mut adjacency: HashMap<&InstanceNodeSessionId, Vec<&InstanceNodeSessionId>> =
            HashMap::new();
        for link in deduped.values() {
            adjacency.entry(&link.source).or_default().push(&link.target);
        }

        let routes = shortest_paths(&local, &adjacency);

        let mut nodes: BTreeSet<InstanceNodeSessionId> = routes.keys().cloned().collect();
        nodes.insert(local.clone());

        let links: BTreeSet<LinkDescriptor> = deduped
            .into_values()
            .filter(|l| nodes.contains(&l.source) && nodes.contains(&l.target))
            .collect();
        properties.retain(|node, _| nodes.contains(node));

        Self {
            version,
            local,
            nodes,
            links,
            properties,
            routes,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn local_node(&self) -> &InstanceNodeSessionId {
        &self.local
    }

    /// All reachable sessions, including the local one
    pub fn reachable_nodes(&self) -> &BTreeSet<InstanceNodeSessionId> {
        &self.nodes
    }

    pub fn is_reachable(&self, node: &InstanceNodeSessionId) -> bool {
        self.nodes.contains(node)
    }

    /// A logical node is reachable if its session is and the session
    /// announced that logical part (the default part always exists)
    pub fn is_logical_node_reachable(&self, node: &LogicalNodeId) -> bool {
        let session = node.session_id();
        if !self.is_reachable(&session) {
            return false;
        }
        node.is_default_logical_node()
            || self
                .properties
                .get(&session)
                .is_some_and(|p| p.logical_nodes.contains_key(node.logical_part()))
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkDescriptor> {
        self.links.iter()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn properties(&self, node: &InstanceNodeSessionId) -> Option<&NodeProperties> {
        self.properties.get(node)
    }

    pub fn route(&self, target: &InstanceNodeSessionId) -> Option<&Route> {
        self.routes.get(target)
    }

    /// Neighbour to forward to for `target`; `None` for the local node or
    /// an unreachable target
    pub fn next_hop(&self, target: &InstanceNodeSessionId) -> Option<&InstanceNodeSessionId> {
        self.routes.get(target).map(|r| &r.next_hop)
    }

    pub fn hop_count(&self, target: &InstanceNodeSessionId) -> Option<u32> {
        if target == &self.local {
            return Some(0);
        }
        self.routes.get(target).map(|r| r.hop_count)
    }

    /// Full path from the local node to `target`, both ends included
    pub fn path_to(&self, target: &InstanceNodeSessionId) -> Option<Vec<InstanceNodeSessionId>> {
        if target == &self.local {
            return Some(vec![self.local.clone()]);
        }
        let mut path = vec![target.clone()];
        let mut current = target;
        while let Some(route) = self.routes.get(current) {
            path.push(route.predecessor.clone());
            current = &route.predecessor;
        }
        if current != &self.local {
            return None;
        }
        path.reverse();
        Some(path)
    }

    /// Logical nodes of reachable sessions that advertise `capability`
    pub fn reachable_nodes_with_capability(&self, capability: &str) -> BTreeSet<LogicalNodeId> {
        self.properties
            .iter()
            .flat_map(|(session, props)| {
                props
                    .logical_nodes
                    .iter()
                    .filter(|(_, info)| info.capabilities.contains(capability))
                    .filter_map(move |(part, _)| session.logical_node_id(part).ok())
            })
            .collect()
    }

    /// Changes from `previous` to this snapshot
    pub fn diff(&self, previous: &NetworkGraph) -> GraphDiff {
        let added: BTreeSet<_> = self.nodes.difference(&previous.nodes).cloned().collect();
        let removed: BTreeSet<_> = previous.nodes.difference(&self.nodes).cloned().collect();
        let topology_changed = !added.is_empty()
            || !removed.is_empty()
            || self.links != previous.links
            || self.properties != previous.properties;
        GraphDiff {
            added,
            removed,
            topology_changed,
        }
    }
}

/// Drop self-loops and keep one link per (source, target) pair
fn deduplicate<I>(links: I) -> BTreeMap<(InstanceNodeSessionId, InstanceNodeSessionId), LinkDescriptor>
where
    I: IntoIterator<Item = LinkDescriptor>,
{
    let mut best: BTreeMap<(InstanceNodeSessionId, InstanceNodeSessionId), LinkDescriptor> =
        BTreeMap::new();
    for link in links {
        if link.source == link.target {
            continue;
        }
        let key = (link.source.clone(), link.target.clone());
        match best.get(&key) {
            Some(existing) if existing.preference_key() <= link.preference_key() => {}
            _ => {
                best.insert(key, link);
            }
        }
    }
    best
}

/// Layered BFS from `local`
///
/// Each node's next hop is the smallest next hop among its predecessors in
/// the previous layer, which yields the smallest first hop over all
/// shortest paths.
fn shortest_paths(
    local: &InstanceNodeSessionId,
    adjacency: &HashMap<&InstanceNodeSessionId, Vec<&InstanceNodeSessionId>>,
) -> BTreeMap<InstanceNodeSessionId, Route> {
    let mut routes: BTreeMap<InstanceNodeSessionId, Route> = BTreeMap::new();
    let mut frontier: Vec<InstanceNodeSessionId> = vec![local.clone()];
    let mut hop_count = 0u32;

    while !frontier.is_empty() {
        hop_count += 1;
        let mut layer: BTreeMap<InstanceNodeSessionId, Route> = BTreeMap::new();

        for node in &frontier {
            let first_hop = routes.get(node).map(|r| &r.next_hop);
            for &target in adjacency.get(node).map(Vec::as_slice).unwrap_or_default() {
                if target == local || routes.contains_key(target) {
                    continue;
                }
                let candidate = Route {
                    next_hop: first_hop.unwrap_or(target).clone(),
                    hop_count,
                    predecessor: node.clone(),
                };
                match layer.get(target) {
                    Some(existing)
                        if (&existing.next_hop, &existing.predecessor)
                            <= (&candidate.next_hop, &candidate.predecessor) => {}
                    _ => {
                        layer.insert(target.clone(), candidate);
                    }
                }
            }
        }

        frontier = layer.keys().cloned().collect();
        routes.extend(layer);
    }

    routes
}

impl std::fmt::Display for NetworkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "graph v{} of {}: {} nodes, {} links",
            self.version,
            self.local.short_id(),
            self.nodes.len(),
            self.links.len()
        )
    }
}

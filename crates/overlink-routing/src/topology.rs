//! Topology service
//!
//! Tracks the local node's links and the advertisements received from the
//! rest of the overlay, and publishes a fresh [`NetworkGraph`] after every
//! change. Snapshots are shared as `Arc<NetworkGraph>` through a watch
//! channel; readers never take a lock and keep whatever snapshot they hold.
//!
//! All mutations go through one mutex (the single writer). Listener
//! callbacks run after the mutex is released.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use overlink_core::{
    InstanceNodeSessionId, LogicalNodeId, NodeIdentifier, RoutingError,
};

use crate::error::{TopologyError, TopologyResult};
use crate::graph::{GraphDiff, LinkDescriptor, NetworkGraph, NodeProperties};
use crate::link_state::{
    AdvertisedLink, AdvertisementReason, ApplyOutcome, LinkStateAdvertisement, LinkStateDatabase,
    LogicalNodeAdvertisement, SessionRank,
};

/// Receives topology notifications
///
/// Both methods run on the task that caused the change and must not block.
pub trait TopologyListener: Send + Sync {
    /// Called whenever a new snapshot differs from the previous one
    fn on_topology_changed(&self, _graph: &Arc<NetworkGraph>) {}

    /// Called when the reachable set grew or shrank
    fn on_reachable_nodes_changed(
        &self,
        _added: &BTreeSet<InstanceNodeSessionId>,
        _removed: &BTreeSet<InstanceNodeSessionId>,
    ) {
    }
}

/// Topology service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Drop advertisements of older sessions once a newer session of the
    /// same installation advertises itself
    pub replace_older_sessions: bool,

    /// How long an advertisement is kept after its owner became
    /// unreachable (milliseconds)
    pub stale_advertisement_age_ms: u64,

    /// How often stale advertisements are looked for (milliseconds)
    pub eviction_interval_ms: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            replace_older_sessions: true,
            stale_advertisement_age_ms: 60_000,
            eviction_interval_ms: 10_000,
        }
    }
}

impl TopologyConfig {
    pub fn with_replace_older_sessions(mut self, replace: bool) -> Self {
        self.replace_older_sessions = replace;
        self
    }

    pub fn with_stale_advertisement_age(mut self, age: Duration) -> Self {
        self.stale_advertisement_age_ms = age.as_millis() as u64;
        self
    }

    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn stale_advertisement_age(&self) -> Duration {
        Duration::from_millis(self.stale_advertisement_age_ms)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms.max(1))
    }
}

struct TopologyState {
    local_links: BTreeMap<String, AdvertisedLink>,
    logical_nodes: BTreeMap<String, LogicalNodeAdvertisement>,
    database: LinkStateDatabase,
    sequence: u64,
    reason: AdvertisementReason,
    next_link_seq: u64,
    version: u64,
}

/// Owner of the live topology of one session
pub struct TopologyService {
    local: InstanceNodeSessionId,
    session_started_ms: u64,
    display_name: String,
    config: TopologyConfig,
    state: Mutex<TopologyState>,
    snapshot: watch::Sender<Arc<NetworkGraph>>,
    listeners: RwLock<Vec<Arc<dyn TopologyListener>>>,
}

struct Published {
    graph: Arc<NetworkGraph>,
    diff: GraphDiff,
}

impl TopologyService {
    /// Service for a session starting now
    pub fn new(
        local: InstanceNodeSessionId,
        display_name: impl Into<String>,
        config: TopologyConfig,
    ) -> Self {
        let started_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        Self::with_session_start(local, display_name, config, started_ms)
    }

    /// Service for a session that started at `started_ms` (Unix millis)
    pub fn with_session_start(
        local: InstanceNodeSessionId,
        display_name: impl Into<String>,
        config: TopologyConfig,
        started_ms: u64,
    ) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(NetworkGraph::empty(local.clone())));
        let mut database = LinkStateDatabase::new();
        if config.replace_older_sessions {
            database.note_local_session(SessionRank {
                started_ms,
                session: local.clone(),
            });
        }
        info!(node = %local.short_id(), started_ms, "Topology service started");
        Self {
            local,
            session_started_ms: started_ms,
            display_name: display_name.into(),
            config,
            state: Mutex::new(TopologyState {
                local_links: BTreeMap::new(),
                logical_nodes: BTreeMap::new(),
                database,
                sequence: 1,
                reason: AdvertisementReason::Startup,
                next_link_seq: 0,
                version: 0,
            }),
            snapshot,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn local_node(&self) -> &InstanceNodeSessionId {
        &self.local
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn session_started_ms(&self) -> u64 {
        self.session_started_ms
    }

    /// Number of stored remote advertisements
    pub fn advertisement_count(&self) -> usize {
        self.state.lock().database.len()
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<NetworkGraph> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Watch receiver yielding every new snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<NetworkGraph>> {
        self.snapshot.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn TopologyListener>) {
        self.listeners.write().push(listener);
    }

    /// Record a newly established channel to `target`
    ///
    /// Returns the updated local advertisement to flood.
    pub fn on_link_established(
        &self,
        link_id: impl Into<String>,
        target: InstanceNodeSessionId,
        latency_ms: u32,
    ) -> TopologyResult<LinkStateAdvertisement> {
        let link_id = link_id.into();
        let (lsa, published) = {
            let mut state = self.state.lock();
            self.ensure_running(&state)?;
            let established_seq = state.next_link_seq;
            state.next_link_seq += 1;
            debug!(
                link = %link_id,
                target = %target.short_id(),
                latency_ms,
                "Link established"
            );
            state.local_links.insert(
                link_id.clone(),
                AdvertisedLink {
                    link_id,
                    target,
                    latency_ms,
                    established_seq,
                },
            );
            let lsa = self.bump_local(&mut state, AdvertisementReason::Update);
            (lsa, self.recompute(&mut state))
        };
        self.notify(published);
        Ok(lsa)
    }

    /// Forget a closed channel
    ///
    /// Returns the updated local advertisement, or `None` if the link was
    /// unknown.
    pub fn on_link_closed(&self, link_id: &str) -> Option<LinkStateAdvertisement> {
        let (lsa, published) = {
            let mut state = self.state.lock();
            if state.reason == AdvertisementReason::Shutdown {
                return None;
            }
            let removed = state.local_links.remove(link_id)?;
            debug!(
                link = %link_id,
                target = %removed.target.short_id(),
                "Link closed"
            );
            let lsa = self.bump_local(&mut state, AdvertisementReason::Update);
            (lsa, self.recompute(&mut state))
        };
        self.notify(published);
        Some(lsa)
    }

    /// Announce a logical node of this session with its capabilities
    ///
    /// Announcing an existing logical part replaces its metadata.
    pub fn add_logical_node(
        &self,
        logical_part: &str,
        display_name: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> TopologyResult<(LogicalNodeId, LinkStateAdvertisement)> {
        let id = self.local.logical_node_id(logical_part)?;
        let advertisement = LogicalNodeAdvertisement {
            logical_part: id.logical_part().to_string(),
            display_name: display_name.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        };
        let (lsa, published) = {
            let mut state = self.state.lock();
            self.ensure_running(&state)?;
            state
                .logical_nodes
                .insert(advertisement.logical_part.clone(), advertisement);
            let lsa = self.bump_local(&mut state, AdvertisementReason::Update);
            (lsa, self.recompute(&mut state))
        };
        info!(logical_node = %id, "Logical node announced");
        self.notify(published);
        Ok((id, lsa))
    }

    /// Withdraw a logical node; returns the new advertisement if it existed
    pub fn remove_logical_node(&self, logical_part: &str) -> Option<LinkStateAdvertisement> {
        let (lsa, published) = {
            let mut state = self.state.lock();
            state.logical_nodes.remove(logical_part)?;
            let lsa = self.bump_local(&mut state, AdvertisementReason::Update);
            (lsa, self.recompute(&mut state))
        };
        self.notify(published);
        Some(lsa)
    }

    /// Apply an advertisement received from a neighbour
    ///
    /// Returns true if it was newer than what we knew, in which case the
    /// caller floods it on to its other neighbours.
    pub fn apply_advertisement(&self, lsa: LinkStateAdvertisement) -> bool {
        if lsa.owner == self.local {
            return false;
        }
        let published = {
            let mut state = self.state.lock();
            let owner = lsa.owner.clone();
            let sequence = lsa.sequence;
            let reason = lsa.reason;
            match state.database.apply(lsa, self.config.replace_older_sessions) {
                ApplyOutcome::Stale | ApplyOutcome::Superseded => return false,
                ApplyOutcome::Applied => {
                    debug!(
                        owner = %owner.short_id(),
                        sequence,
                        ?reason,
                        "Applied link state advertisement"
                    );
                }
            }
            self.recompute(&mut state)
        };
        self.notify(published);
        true
    }

    /// Drop advertisements whose owner has been unreachable for longer than
    /// the configured age; returns how many were dropped
    pub fn evict_stale_advertisements(&self) -> usize {
        let (evicted, published) = {
            let mut state = self.state.lock();
            let evicted = state
                .database
                .evict_unreachable(self.config.stale_advertisement_age(), Instant::now());
            if evicted.is_empty() {
                return 0;
            }
            for owner in &evicted {
                debug!(owner = %owner.short_id(), "Evicted stale advertisement");
            }
            (evicted.len(), self.recompute(&mut state))
        };
        info!(evicted, "Stale advertisements evicted");
        self.notify(published);
        evicted
    }

    /// The local advertisement at its current sequence
    pub fn local_advertisement(&self) -> LinkStateAdvertisement {
        let state = self.state.lock();
        self.build_local(&state)
    }

    /// Everything we know, local advertisement first
    ///
    /// Sent to a neighbour over a freshly established channel.
    pub fn advertisement_batch(&self) -> Vec<LinkStateAdvertisement> {
        let state = self.state.lock();
        std::iter::once(self.build_local(&state))
            .chain(state.database.advertisements().cloned())
            .collect()
    }

    /// Final advertisement announcing that this session leaves
    ///
    /// Further link changes are ignored afterwards.
    pub fn shutdown_advertisement(&self) -> LinkStateAdvertisement {
        let mut state = self.state.lock();
        if state.reason == AdvertisementReason::Shutdown {
            return self.build_local(&state);
        }
        info!(node = %self.local.short_id(), "Topology service shutting down");
        self.bump_local(&mut state, AdvertisementReason::Shutdown)
    }

    /// Neighbour to send to for reaching `target`
    pub fn next_hop(&self, target: &InstanceNodeSessionId) -> Result<InstanceNodeSessionId, RoutingError> {
        self.snapshot()
            .next_hop(target)
            .cloned()
            .ok_or_else(|| RoutingError::NoRoute(target.to_string()))
    }

    pub fn is_reachable(&self, target: &InstanceNodeSessionId) -> bool {
        self.snapshot().is_reachable(target)
    }

    /// Logical nodes with `capability` on reachable sessions
    pub fn reachable_nodes_with_capability(&self, capability: &str) -> BTreeSet<LogicalNodeId> {
        self.snapshot().reachable_nodes_with_capability(capability)
    }

    fn ensure_running(&self, state: &TopologyState) -> TopologyResult<()> {
        if state.reason == AdvertisementReason::Shutdown {
            return Err(TopologyError::ShutDown);
        }
        Ok(())
    }

    fn bump_local(&self, state: &mut TopologyState, reason: AdvertisementReason) -> LinkStateAdvertisement {
        state.sequence += 1;
        state.reason = reason;
        self.build_local(state)
    }

    fn build_local(&self, state: &TopologyState) -> LinkStateAdvertisement {
        LinkStateAdvertisement {
            owner: self.local.clone(),
            session_started_ms: self.session_started_ms,
            sequence: state.sequence,
            reason: state.reason,
            display_name: self.display_name.clone(),
            links: state.local_links.values().cloned().collect(),
            logical_nodes: state.logical_nodes.values().cloned().collect(),
        }
    }

    /// Build and publish a new snapshot; caller holds the state lock
    fn recompute(&self, state: &mut TopologyState) -> Option<Published> {
        let local_lsa = self.build_local(state);

        let mut properties: BTreeMap<InstanceNodeSessionId, NodeProperties> = BTreeMap::new();
        properties.insert(self.local.clone(), local_lsa.properties());
        let mut links: Vec<LinkDescriptor> = local_lsa.link_descriptors().collect();
        for lsa in state.database.advertisements() {
            if lsa.is_shutdown() {
                continue;
            }
            properties.insert(lsa.owner.clone(), lsa.properties());
            links.extend(lsa.link_descriptors());
        }

        let previous = self.snapshot();
        let candidate = NetworkGraph::build(self.local.clone(), links, properties, state.version + 1);
        state
            .database
            .mark_reachability(|owner| candidate.is_reachable(owner), Instant::now());
        let diff = candidate.diff(&previous);
        if !diff.topology_changed {
            return None;
        }

        state.version += 1;
        let graph = Arc::new(candidate);
        self.snapshot.send_replace(Arc::clone(&graph));

        if diff.reachability_changed() {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                reachable = graph.reachable_nodes().len(),
                version = graph.version(),
                "Reachable nodes changed"
            );
        }
        Some(Published { graph, diff })
    }

    fn notify(&self, published: Option<Published>) {
        let Some(Published { graph, diff }) = published else {
            return;
        };
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            if diff.reachability_changed() {
                listener.on_reachable_nodes_changed(&diff.added, &diff.removed);
            }
            listener.on_topology_changed(&graph);
        }
    }
}

impl std::fmt::Debug for TopologyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyService")
            .field("local", &self.local)
            .field("snapshot", &self.snapshot.borrow().to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use overlink_core::InstanceNodeId;

    use super::*;

    fn session() -> InstanceNodeSessionId {
        InstanceNodeId::generate().new_session()
    }

    fn service() -> TopologyService {
        TopologyService::new(session(), "local", TopologyConfig::default())
    }

    #[derive(Default)]
    struct CountingListener {
        changes: AtomicUsize,
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    impl TopologyListener for CountingListener {
        fn on_topology_changed(&self, _graph: &Arc<NetworkGraph>) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_reachable_nodes_changed(
            &self,
            added: &BTreeSet<InstanceNodeSessionId>,
            removed: &BTreeSet<InstanceNodeSessionId>,
        ) {
            self.added.fetch_add(added.len(), Ordering::SeqCst);
            self.removed.fetch_add(removed.len(), Ordering::SeqCst);
        }
    }

    #[test]
    fn test_link_lifecycle() {
        let topology = service();
        let listener = Arc::new(CountingListener::default());
        topology.add_listener(listener.clone());
        let peer = session();

        let lsa = topology.on_link_established("direct-1", peer.clone(), 3).unwrap();
        assert_eq!(lsa.links.len(), 1);
        assert!(topology.is_reachable(&peer));
        assert_eq!(topology.next_hop(&peer).unwrap(), peer);

        let held = topology.snapshot();
        let lsa2 = topology.on_link_closed("direct-1").unwrap();
        assert!(lsa2.sequence > lsa.sequence);
        assert!(lsa2.links.is_empty());
        assert!(!topology.is_reachable(&peer));
        assert!(matches!(
            topology.next_hop(&peer),
            Err(RoutingError::NoRoute(_))
        ));

        // A snapshot obtained earlier stays valid
        assert!(held.is_reachable(&peer));
        assert!(topology.on_link_closed("direct-1").is_none());

        assert_eq!(listener.added.load(Ordering::SeqCst), 1);
        assert_eq!(listener.removed.load(Ordering::SeqCst), 1);
        assert_eq!(listener.changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_multi_hop_via_advertisement() {
        let topology = service();
        let local = topology.local_node().clone();
        let (b, c) = (session(), session());
        topology.on_link_established("direct-1", b.clone(), 1).unwrap();

        let b_lsa = LinkStateAdvertisement {
            owner: b.clone(),
            session_started_ms: 0,
            sequence: 4,
            reason: AdvertisementReason::Update,
            display_name: "b".into(),
            links: vec![
                AdvertisedLink {
                    link_id: "b-1".into(),
                    target: local.clone(),
                    latency_ms: 1,
                    established_seq: 0,
                },
                AdvertisedLink {
                    link_id: "b-2".into(),
                    target: c.clone(),
                    latency_ms: 1,
                    established_seq: 1,
                },
            ],
            logical_nodes: vec![],
        };
        assert!(topology.apply_advertisement(b_lsa.clone()));
        assert!(!topology.apply_advertisement(b_lsa.clone()));
        assert_eq!(topology.next_hop(&c).unwrap(), b);
        assert_eq!(topology.snapshot().hop_count(&c), Some(2));

        let mut shutdown = b_lsa;
        shutdown.sequence = 5;
        shutdown.reason = AdvertisementReason::Shutdown;
        assert!(topology.apply_advertisement(shutdown));
        assert!(!topology.is_reachable(&c));
        // Direct link is still known locally
        assert!(topology.is_reachable(&b));
    }

    #[test]
    fn test_own_advertisement_ignored() {
        let topology = service();
        let own = topology.local_advertisement();
        assert!(!topology.apply_advertisement(own));
    }

    #[test]
    fn test_logical_node_capability() {
        let topology = service();
        let (id, lsa) = topology
            .add_logical_node("1", "host", ["workflow-host"])
            .unwrap();
        assert_eq!(lsa.logical_nodes.len(), 1);
        assert_eq!(
            topology.reachable_nodes_with_capability("workflow-host"),
            BTreeSet::from([id])
        );
        assert!(topology.add_logical_node("not hex", "bad", ["x"]).is_err());

        assert!(topology.remove_logical_node("1").is_some());
        assert!(topology.reachable_nodes_with_capability("workflow-host").is_empty());
    }

    #[test]
    fn test_batch_and_shutdown() {
        let topology = service();
        let peer = session();
        topology.on_link_established("direct-1", peer.clone(), 1).unwrap();
        topology.apply_advertisement(LinkStateAdvertisement {
            owner: peer.clone(),
            session_started_ms: 0,
            sequence: 2,
            reason: AdvertisementReason::Startup,
            display_name: "peer".into(),
            links: vec![],
            logical_nodes: vec![],
        });

        let batch = topology.advertisement_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].owner, *topology.local_node());

        let bye = topology.shutdown_advertisement();
        assert!(bye.is_shutdown());
        assert_eq!(topology.shutdown_advertisement().sequence, bye.sequence);
        assert!(matches!(
            topology.on_link_established("direct-2", session(), 1),
            Err(TopologyError::ShutDown)
        ));
        assert!(topology.on_link_closed("direct-1").is_none());
    }

    fn bare_lsa(owner: &InstanceNodeSessionId, started_ms: u64, sequence: u64) -> LinkStateAdvertisement {
        LinkStateAdvertisement {
            owner: owner.clone(),
            session_started_ms: started_ms,
            sequence,
            reason: AdvertisementReason::Update,
            display_name: "remote".into(),
            links: vec![],
            logical_nodes: vec![],
        }
    }

    #[test]
    fn test_previous_incarnation_refused() {
        let instance = InstanceNodeId::generate();
        let previous = instance.new_session();
        let topology = TopologyService::with_session_start(
            instance.new_session(),
            "local",
            TopologyConfig::default(),
            10_000,
        );
        assert_eq!(topology.local_advertisement().session_started_ms, 10_000);
        assert!(!topology.apply_advertisement(bare_lsa(&previous, 9_000, 40)));
        assert_eq!(topology.advertisement_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_advertisements_evicted() {
        let config = TopologyConfig::default().with_stale_advertisement_age(Duration::from_secs(30));
        let topology = TopologyService::new(session(), "local", config);
        let (peer, orphan) = (session(), session());
        topology.on_link_established("direct-1", peer.clone(), 1).unwrap();
        assert!(topology.apply_advertisement(bare_lsa(&peer, 0, 1)));
        assert!(topology.apply_advertisement(bare_lsa(&orphan, 0, 1)));
        let mut gone = bare_lsa(&session(), 0, 2);
        gone.reason = AdvertisementReason::Shutdown;
        assert!(topology.apply_advertisement(gone));
        assert_eq!(topology.advertisement_count(), 3);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(topology.evict_stale_advertisements(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(topology.evict_stale_advertisements(), 2);
        assert_eq!(topology.advertisement_count(), 1);
        assert!(topology.is_reachable(&peer));

        // The peer lost its link; it goes after its own grace period
        topology.on_link_closed("direct-1").unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(topology.evict_stale_advertisements(), 0);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(topology.evict_stale_advertisements(), 1);
        assert_eq!(topology.advertisement_count(), 0);
    }

    #[test]
    fn test_eviction_config_defaults() {
        let config = TopologyConfig::default();
        assert_eq!(config.stale_advertisement_age(), Duration::from_secs(60));
        assert_eq!(config.eviction_interval(), Duration::from_secs(10));
        let tuned = config.with_eviction_interval(Duration::from_millis(250));
        assert_eq!(tuned.eviction_interval_ms, 250);
    }

    #[tokio::test]
    async fn test_subscribe_sees_new_snapshot() {
        let topology = service();
        let mut rx = topology.subscribe();
        let peer = session();
        topology.on_link_established("direct-1", peer.clone(), 1).unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_reachable(&peer));
    }
}

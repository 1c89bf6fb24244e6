//! Link-state advertisements
//!
//! Every node describes its own outgoing links and logical nodes in a
//! [`LinkStateAdvertisement`] with a sequence number. Advertisements are
//! flooded through the overlay; a receiver keeps only the newest one per
//! owner, and only the newest session per installation, so the resulting
//! knowledge does not depend on arrival order.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use overlink_core::{InstanceNodeId, InstanceNodeSessionId, NodeIdentifier};

use crate::graph::{LinkDescriptor, LogicalNodeInfo, NodeProperties};

/// Why an advertisement was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisementReason {
    Startup,
    Update,
    /// The owner is leaving; its links are void
    Shutdown,
}

/// One outgoing link of the advertising node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedLink {
    /// Channel id on the owner's side
    pub link_id: String,
    pub target: InstanceNodeSessionId,
    pub latency_ms: u32,
    /// Owner-local establishment order, lower is older
    pub established_seq: u64,
}

/// Logical node metadata carried in advertisements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalNodeAdvertisement {
    pub logical_part: String,
    pub display_name: String,
    pub capabilities: Vec<String>,
}

/// A node's description of itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStateAdvertisement {
    pub owner: InstanceNodeSessionId,
    /// Wall clock start of the owner's session in milliseconds; orders
    /// sessions of the same installation
    pub session_started_ms: u64,
    pub sequence: u64,
    pub reason: AdvertisementReason,
    pub display_name: String,
    pub links: Vec<AdvertisedLink>,
    pub logical_nodes: Vec<LogicalNodeAdvertisement>,
}

impl LinkStateAdvertisement {
    pub fn is_shutdown(&self) -> bool {
        self.reason == AdvertisementReason::Shutdown
    }

    /// Rank of the owner's session among sessions of its installation
    pub fn session_rank(&self) -> SessionRank {
        SessionRank {
            started_ms: self.session_started_ms,
            session: self.owner.clone(),
        }
    }

    /// Links as graph edges; a shutdown advertisement has none
    pub fn link_descriptors(&self) -> impl Iterator<Item = LinkDescriptor> + '_ {
        let links = if self.is_shutdown() { &[][..] } else { &self.links[..] };
        links.iter().map(|link| LinkDescriptor {
            link_id: link.link_id.clone(),
            source: self.owner.clone(),
            target: link.target.clone(),
            latency_ms: link.latency_ms,
            established_seq: link.established_seq,
        })
    }

    /// Node properties for the snapshot
    pub fn properties(&self) -> NodeProperties {
        let logical_nodes = self
            .logical_nodes
            .iter()
            .map(|ln| {
                (
                    ln.logical_part.clone(),
                    LogicalNodeInfo {
                        display_name: ln.display_name.clone(),
                        capabilities: ln.capabilities.iter().cloned().collect::<BTreeSet<_>>(),
                    },
                )
            })
            .collect();
        NodeProperties {
            display_name: self.display_name.clone(),
            logical_nodes,
        }
    }
}

/// Total order of the sessions of one installation: later start wins, the
/// session id breaks ties
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionRank {
    pub started_ms: u64,
    pub session: InstanceNodeSessionId,
}

/// Outcome of offering an advertisement to the database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Newer than what we had; should be flooded on
    Applied,
    /// Same or older sequence; ignore
    Stale,
    /// A newer session of the same installation is known; ignore
    Superseded,
}

impl ApplyOutcome {
    pub fn is_applied(self) -> bool {
        self == ApplyOutcome::Applied
    }
}

#[derive(Debug, Clone)]
struct StoredAdvertisement {
    lsa: LinkStateAdvertisement,
    /// Since when the owner has been missing from the snapshot
    unreachable_since: Option<Instant>,
}

/// Newest advertisement per owner
///
/// With session replacement on, only the newest known session of each
/// installation is kept, so the stored set does not depend on the order in
/// which advertisements of old and new sessions arrive.
#[derive(Debug, Default, Clone)]
pub struct LinkStateDatabase {
    entries: BTreeMap<InstanceNodeSessionId, StoredAdvertisement>,
    newest_sessions: BTreeMap<InstanceNodeId, SessionRank>,
}

impl LinkStateDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the local session so advertisements of its predecessors
    /// still circulating in the overlay are refused
    pub fn note_local_session(&mut self, rank: SessionRank) {
        self.newest_sessions
            .insert(rank.session.instance_node_id(), rank);
    }

    /// Store `lsa` if its sequence is newer than the stored one
    ///
    /// With `replace_older_sessions`, an advertisement from a newer session
    /// drops the entries of older sessions of the same installation, and
    /// advertisements of older sessions are refused.
    pub fn apply(&mut self, lsa: LinkStateAdvertisement, replace_older_sessions: bool) -> ApplyOutcome {
        if let Some(existing) = self.entries.get(&lsa.owner) {
            if existing.lsa.sequence >= lsa.sequence {
                return ApplyOutcome::Stale;
            }
        }

        if replace_older_sessions {
            let rank = lsa.session_rank();
            let instance = lsa.owner.instance_node_id();
            match self.newest_sessions.get(&instance) {
                Some(newest) if rank < *newest => {
                    debug!(
                        owner = %lsa.owner.short_id(),
                        newest = %newest.session.session_part(),
                        "Ignoring advertisement of a replaced session"
                    );
                    return ApplyOutcome::Superseded;
                }
                Some(newest) if rank == *newest => {}
                _ => {
                    let owner = lsa.owner.clone();
                    self.entries.retain(|session, _| {
                        let replaced = session != &owner && session.is_same_instance_node_as(&owner);
                        if replaced {
                            debug!(
                                old = %session.session_part(),
                                new = %owner.session_part(),
                                "Dropping advertisement of replaced session"
                            );
                        }
                        !replaced
                    });
                    self.newest_sessions.insert(instance, rank);
                }
            }
        }

        let unreachable_since = self
            .entries
            .get(&lsa.owner)
            .and_then(|stored| stored.unreachable_since);
        self.entries.insert(
            lsa.owner.clone(),
            StoredAdvertisement {
                lsa,
                unreachable_since,
            },
        );
        ApplyOutcome::Applied
    }

    pub fn get(&self, owner: &InstanceNodeSessionId) -> Option<&LinkStateAdvertisement> {
        self.entries.get(owner).map(|stored| &stored.lsa)
    }

    pub fn remove(&mut self, owner: &InstanceNodeSessionId) -> Option<LinkStateAdvertisement> {
        let stored = self.entries.remove(owner)?;
        let instance = owner.instance_node_id();
        if self
            .newest_sessions
            .get(&instance)
            .is_some_and(|newest| &newest.session == owner)
        {
            self.newest_sessions.remove(&instance);
        }
        Some(stored.lsa)
    }

    /// Record which owners the latest snapshot reaches
    pub fn mark_reachability(&mut self, is_reachable: impl Fn(&InstanceNodeSessionId) -> bool, now: Instant) {
        for (owner, stored) in self.entries.iter_mut() {
            if is_reachable(owner) {
                stored.unreachable_since = None;
            } else if stored.unreachable_since.is_none() {
                stored.unreachable_since = Some(now);
            }
        }
    }

    /// Drop advertisements whose owner has been unreachable for `max_age`
    ///
    /// Shutdown advertisements never reach the snapshot, so they expire the
    /// same way once they had time to spread.
    pub fn evict_unreachable(&mut self, max_age: Duration, now: Instant) -> Vec<InstanceNodeSessionId> {
        let expired: Vec<InstanceNodeSessionId> = self
            .entries
            .iter()
            .filter(|(_, stored)| {
                stored
                    .unreachable_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= max_age)
            })
            .map(|(owner, _)| owner.clone())
            .collect();
        for owner in &expired {
            self.remove(owner);
        }
        expired
    }

    /// All stored advertisements, ordered by owner
    pub fn advertisements(&self) -> impl Iterator<Item = &LinkStateAdvertisement> {
        self.entries.values().map(|stored| &stored.lsa)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsa(owner: &InstanceNodeSessionId, sequence: u64, targets: &[&InstanceNodeSessionId]) -> LinkStateAdvertisement {
        started_lsa(owner, 0, sequence, targets)
    }

    fn started_lsa(
        owner: &InstanceNodeSessionId,
        started_ms: u64,
        sequence: u64,
        targets: &[&InstanceNodeSessionId],
    ) -> LinkStateAdvertisement {
        LinkStateAdvertisement {
            owner: owner.clone(),
            session_started_ms: started_ms,
            sequence,
            reason: AdvertisementReason::Update,
            display_name: "node".into(),
            links: targets
                .iter()
                .enumerate()
                .map(|(i, t)| AdvertisedLink {
                    link_id: format!("l{i}"),
                    target: (*t).clone(),
                    latency_ms: 0,
                    established_seq: i as u64,
                })
                .collect(),
            logical_nodes: vec![],
        }
    }

    #[test]
    fn test_newer_sequence_wins() {
        let a = InstanceNodeId::generate().new_session();
        let b = InstanceNodeId::generate().new_session();
        let mut db = LinkStateDatabase::new();

        assert_eq!(db.apply(lsa(&a, 2, &[&b]), true), ApplyOutcome::Applied);
        assert_eq!(db.apply(lsa(&a, 1, &[]), true), ApplyOutcome::Stale);
        assert_eq!(db.apply(lsa(&a, 2, &[]), true), ApplyOutcome::Stale);
        assert_eq!(db.get(&a).unwrap().links.len(), 1);

        assert_eq!(db.apply(lsa(&a, 3, &[]), true), ApplyOutcome::Applied);
        assert!(db.get(&a).unwrap().links.is_empty());
    }

    #[test]
    fn test_shutdown_has_no_links() {
        let a = InstanceNodeId::generate().new_session();
        let b = InstanceNodeId::generate().new_session();
        let mut shutdown = lsa(&a, 5, &[&b]);
        shutdown.reason = AdvertisementReason::Shutdown;
        assert_eq!(shutdown.link_descriptors().count(), 0);

        let mut db = LinkStateDatabase::new();
        db.apply(shutdown, true);
        assert_eq!(db.apply(lsa(&a, 4, &[&b]), true), ApplyOutcome::Stale);
    }

    #[test]
    fn test_new_session_replaces_old() {
        let instance = InstanceNodeId::generate();
        let old = instance.new_session();
        let new = instance.new_session();
        let mut db = LinkStateDatabase::new();

        db.apply(started_lsa(&old, 1_000, 10, &[]), true);
        assert_eq!(db.apply(started_lsa(&new, 2_000, 1, &[]), true), ApplyOutcome::Applied);
        assert!(db.get(&old).is_none());
        assert!(db.get(&new).is_some());

        let mut keep_all = LinkStateDatabase::new();
        keep_all.apply(started_lsa(&old, 1_000, 10, &[]), false);
        keep_all.apply(started_lsa(&new, 2_000, 1, &[]), false);
        assert_eq!(keep_all.len(), 2);
    }

    #[test]
    fn test_old_session_cannot_displace_new() {
        let instance = InstanceNodeId::generate();
        let old = instance.new_session();
        let new = instance.new_session();
        let peer = InstanceNodeId::generate().new_session();

        // New session first, then a late advertisement of the old one
        let mut db = LinkStateDatabase::new();
        db.apply(started_lsa(&new, 2_000, 1, &[&peer]), true);
        assert_eq!(
            db.apply(started_lsa(&old, 1_000, 7, &[&peer]), true),
            ApplyOutcome::Superseded
        );
        assert!(db.get(&old).is_none());
        assert_eq!(db.get(&new).unwrap().links.len(), 1);

        // Reverse order ends in the same state
        let mut reversed = LinkStateDatabase::new();
        reversed.apply(started_lsa(&old, 1_000, 7, &[&peer]), true);
        reversed.apply(started_lsa(&new, 2_000, 1, &[&peer]), true);
        let owners = |db: &LinkStateDatabase| db.advertisements().map(|a| a.owner.clone()).collect::<Vec<_>>();
        assert_eq!(owners(&db), owners(&reversed));
    }

    #[test]
    fn test_equal_start_times_break_ties_by_session() {
        let instance = InstanceNodeId::generate();
        let a = instance.new_session();
        let b = instance.new_session();
        let winner = if a > b { a.clone() } else { b.clone() };

        let mut first = LinkStateDatabase::new();
        first.apply(started_lsa(&a, 500, 1, &[]), true);
        first.apply(started_lsa(&b, 500, 1, &[]), true);
        let mut second = LinkStateDatabase::new();
        second.apply(started_lsa(&b, 500, 1, &[]), true);
        second.apply(started_lsa(&a, 500, 1, &[]), true);

        assert_eq!(first.len(), 1);
        assert!(first.get(&winner).is_some());
        assert!(second.get(&winner).is_some());
    }

    #[test]
    fn test_local_session_refuses_predecessors() {
        let instance = InstanceNodeId::generate();
        let previous = instance.new_session();
        let current = instance.new_session();
        let mut db = LinkStateDatabase::new();
        db.note_local_session(SessionRank {
            started_ms: 5_000,
            session: current,
        });
        assert_eq!(
            db.apply(started_lsa(&previous, 4_000, 30, &[]), true),
            ApplyOutcome::Superseded
        );
        assert!(db.is_empty());
    }

    #[test]
    fn test_unreachable_entries_expire() {
        let a = InstanceNodeId::generate().new_session();
        let b = InstanceNodeId::generate().new_session();
        let mut db = LinkStateDatabase::new();
        db.apply(lsa(&a, 1, &[]), true);
        db.apply(lsa(&b, 1, &[]), true);

        let start = Instant::now();
        let max_age = Duration::from_secs(60);
        db.mark_reachability(|owner| owner == &a, start);
        assert!(db.evict_unreachable(max_age, start + Duration::from_secs(59)).is_empty());

        // Newer advertisement keeps the unreachable timer running
        db.apply(lsa(&b, 2, &[]), true);
        db.mark_reachability(|owner| owner == &a, start + Duration::from_secs(30));
        let evicted = db.evict_unreachable(max_age, start + Duration::from_secs(60));
        assert_eq!(evicted, vec![b.clone()]);
        assert!(db.get(&b).is_none());
        assert!(db.get(&a).is_some());

        // Once gone, the session may come back at any sequence
        assert_eq!(db.apply(lsa(&b, 1, &[]), true), ApplyOutcome::Applied);
    }

    #[test]
    fn test_reachable_again_resets_timer() {
        let a = InstanceNodeId::generate().new_session();
        let mut db = LinkStateDatabase::new();
        db.apply(lsa(&a, 1, &[]), true);

        let start = Instant::now();
        db.mark_reachability(|_| false, start);
        db.mark_reachability(|_| true, start + Duration::from_secs(50));
        db.mark_reachability(|_| false, start + Duration::from_secs(55));
        assert!(
            db.evict_unreachable(Duration::from_secs(60), start + Duration::from_secs(100))
                .is_empty()
        );
    }

    #[test]
    fn test_properties_from_advertisement() {
        let a = InstanceNodeId::generate().new_session();
        let mut ad = lsa(&a, 1, &[]);
        ad.logical_nodes.push(LogicalNodeAdvertisement {
            logical_part: "1".into(),
            display_name: "host role".into(),
            capabilities: vec!["workflow-host".into(), "workflow-host".into()],
        });
        let props = ad.properties();
        assert_eq!(props.logical_nodes["1"].capabilities.len(), 1);
    }
}

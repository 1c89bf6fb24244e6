//! Logical channel id allocation
//!
//! The side that opened the physical connection hands out odd ids, the
//! accepting side even ids, so both can open channels at the same time
//! without colliding. A released id is quarantined for a grace period
//! before it is handed out again; blocks still in flight for the old
//! channel are dropped in the meantime instead of reaching a new one.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use overlink_core::{UplinkError, UplinkResult};

/// Which end of the physical connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSide {
    /// Opened the connection; allocates odd ids
    Connector,
    /// Accepted the connection; allocates even ids
    Acceptor,
}

impl ConnectionSide {
    fn first_id(self) -> u32 {
        match self {
            ConnectionSide::Connector => 1,
            ConnectionSide::Acceptor => 2,
        }
    }

    /// Whether `id` belongs to this side's range
    pub fn owns(self, id: u32) -> bool {
        id != 0 && (id % 2 == 1) == (self == ConnectionSide::Connector)
    }
}

/// Hands out ids of one parity
#[derive(Debug)]
pub struct ChannelIdAllocator {
    side: ConnectionSide,
    grace: Duration,
    next: Option<u32>,
    in_use: HashSet<u32>,
    free: BTreeSet<u32>,
    quarantine: VecDeque<(u32, Instant)>,
}

impl ChannelIdAllocator {
    pub fn new(side: ConnectionSide, grace: Duration) -> Self {
        Self {
            side,
            grace,
            next: Some(side.first_id()),
            in_use: HashSet::new(),
            free: BTreeSet::new(),
            quarantine: VecDeque::new(),
        }
    }

    pub fn side(&self) -> ConnectionSide {
        self.side
    }

    /// Next free id; reuses the smallest id whose grace period is over
    pub fn allocate(&mut self, now: Instant) -> UplinkResult<u32> {
        self.reclaim(now);
        let id = match self.free.pop_first() {
            Some(id) => id,
            None => {
                let id = self.next.ok_or(UplinkError::ChannelIdsExhausted)?;
                self.next = id.checked_add(2);
                id
            }
        };
        self.in_use.insert(id);
        Ok(id)
    }

    /// Return an id; it becomes reusable after the grace period
    pub fn release(&mut self, id: u32, now: Instant) -> bool {
        if !self.in_use.remove(&id) {
            return false;
        }
        self.quarantine.push_back((id, now + self.grace));
        true
    }

    pub fn is_in_use(&self, id: u32) -> bool {
        self.in_use.contains(&id)
    }

    /// Whether `id` was released and is still in its grace period
    pub fn is_quarantined(&self, id: u32) -> bool {
        self.quarantine.iter().any(|(q, _)| *q == id)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    fn reclaim(&mut self, now: Instant) {
        while let Some(&(id, until)) = self.quarantine.front() {
            if until > now {
                break;
            }
            self.quarantine.pop_front();
            self.free.insert(id);
        }
    }
}

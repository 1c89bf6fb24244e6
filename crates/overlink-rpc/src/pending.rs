//! Waiters for outstanding requests
//!
//! One oneshot sender per request id. The map lock is held only for the
//! insert or remove itself. Whoever removes an entry owns it, so a response
//! is delivered at most once and a response for a removed id is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::NetworkResponse;

/// Pending response statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingStats {
    pub pending_count: usize,
    /// Responses that arrived after their waiter was gone
    pub discarded_late_responses: u64,
}

/// Request id to waiter map
#[derive(Default)]
pub struct PendingResponses {
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<NetworkResponse>>>,
    discarded: AtomicU64,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a waiter for `request_id`
    pub fn register(&self, request_id: Uuid) -> oneshot::Receiver<NetworkResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id, tx);
        rx
    }

    /// Hand a response to its waiter
    ///
    /// Returns false if nobody was waiting, e.g. after a timeout or cancel.
    pub fn complete(&self, response: NetworkResponse) -> bool {
        let request_id = response.request_id;
        let waiter = self.waiters.lock().remove(&request_id);
        let delivered = match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        };
        if !delivered {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(%request_id, "Discarding response without waiter");
        }
        delivered
    }

    /// Drop the waiter for `request_id`; returns whether it was present
    pub fn remove(&self, request_id: &Uuid) -> bool {
        self.waiters.lock().remove(request_id).is_some()
    }

    /// Drop every waiter; their callers see the call as cancelled
    pub fn clear(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let count = waiters.len();
        waiters.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn stats(&self) -> PendingStats {
        PendingStats {
            pending_count: self.pending_count(),
            discarded_late_responses: self.discarded.load(Ordering::Relaxed),
        }
    }
}

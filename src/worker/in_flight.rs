//! In-flight task bookkeeping for graceful drain

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Set of executions that are running or waiting out a retry delay
///
/// Membership is held by [`InFlightEntry`] guards: an entry is added when
/// the guard is created and removed exactly once when it is dropped.
#[derive(Clone)]
pub struct InFlightSet {
    members: Arc<watch::Sender<HashSet<u64>>>,
    next_handle: Arc<AtomicU64>,
}

impl Default for InFlightSet {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightSet {
    pub fn new() -> Self {
        let (members, _) = watch::channel(HashSet::new());
        Self {
            members: Arc::new(members),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Add a new execution; it stays a member until the returned guard drops
    pub fn enter(&self) -> InFlightEntry {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.members.send_modify(|members| {
            members.insert(handle);
        });
        InFlightEntry {
            handle,
            members: Arc::clone(&self.members),
        }
    }

    pub fn len(&self) -> usize {
        self.members.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.borrow().is_empty()
    }

    /// Resolves once the set is empty; immediately if it already is
    pub async fn drained(&self) {
        let mut members = self.members.subscribe();
        // The sender lives in self, so the channel cannot close while waiting
        let _ = members.wait_for(HashSet::is_empty).await;
    }
}

/// Membership guard for one execution
#[derive(Debug)]
pub struct InFlightEntry {
    handle: u64,
    members: Arc<watch::Sender<HashSet<u64>>>,
}

impl InFlightEntry {
    pub fn handle(&self) -> u64 {
        self.handle
    }
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        let handle = self.handle;
        self.members.send_modify(|members| {
            members.remove(&handle);
        });
    }
}

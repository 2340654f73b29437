//! Per-run exclusive leases.
//!
//! Enforces the single-writer rule: at most one `advance` call holds a given
//! run at a time. Acquisition never waits; a held lease is a conflict the
//! caller retries later.
//!
//! Two layers are involved. `LeaseManager` is the in-process table: its
//! guard releases on drop, which covers early returns, errors, timeouts and
//! panics alike. The storage lease (`WorkflowRepository::try_acquire_lease`)
//! excludes other orchestrators and processes sharing the store; it carries
//! an expiry so a crashed holder cannot keep a run forever.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

/// Added to the longest executor call an `advance` may make to get the
/// storage lease lifetime.
pub const STORE_LEASE_GRACE: Duration = Duration::from_secs(30);

/// In-process lease table keyed by run id.
#[derive(Debug, Clone, Default)]
pub struct LeaseManager {
    held: Arc<DashMap<Uuid, Instant>>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `run_id`, or `None` if someone else holds it.
    pub fn try_acquire(&self, run_id: Uuid) -> Option<LeaseGuard> {
        match self.held.entry(run_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(LeaseGuard {
                    run_id,
                    held: Arc::clone(&self.held),
                })
            }
        }
    }

    pub fn is_held(&self, run_id: &Uuid) -> bool {
        self.held.contains_key(run_id)
    }

    /// Number of leases currently held.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

/// Releases the lease on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    run_id: Uuid,
    held: Arc<DashMap<Uuid, Instant>>,
}

impl LeaseGuard {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some((_, acquired)) = self.held.remove(&self.run_id) {
            tracing::trace!(
                run_id = %self.run_id,
                held_ms = acquired.elapsed().as_millis() as u64,
                "released run lease"
            );
        }
    }
}

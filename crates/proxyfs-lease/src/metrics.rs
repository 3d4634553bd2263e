//! Lease subsystem metrics collector.
//!
//! Tracks live-coordinator counts, per-state lease counts (the eviction
//! trigger reads these), interrupt traffic, and expiry/eviction totals.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::coordinator::LeaseState;
use serde::{Deserialize, Serialize};

/// Counters shared between the lease service and its coordinators.
#[derive(Debug, Default)]
pub struct LeaseMetrics {
    live_leases: AtomicUsize,
    state_counts: [AtomicUsize; LeaseState::COUNT],
    grants: AtomicU64,
    releases: AtomicU64,
    denials: AtomicU64,
    interrupts_sent: AtomicU64,
    interrupt_expiries: AtomicU64,
    evictions_requested: AtomicU64,
    callback_drops: AtomicU64,
    cancelled_waiters: AtomicU64,
}

/// Point-in-time copy of the metrics counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Number of live per-inode coordinators.
    pub live_leases: usize,
    /// Lease count per coordinator state, indexed by state name.
    pub state_counts: Vec<(String, usize)>,
    /// Total grants (shared, exclusive, promote, demote) delivered.
    pub grants: u64,
    /// Total releases acknowledged.
    pub releases: u64,
    /// Total denied requests.
    pub denials: u64,
    /// Total interrupt callback deliveries attempted.
    pub interrupts_sent: u64,
    /// Revocation episodes that ended by declaring the holder dead.
    pub interrupt_expiries: u64,
    /// Synthetic eviction operations issued.
    pub evictions_requested: u64,
    /// Interrupt callbacks dropped because the channel was full or closed.
    pub callback_drops: u64,
    /// Queued waiters discarded after their reply channel went away.
    pub cancelled_waiters: u64,
}

impl LeaseMetrics {
    /// Creates a zeroed metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a coordinator coming live (initial state None).
    pub fn coordinator_started(&self) {
        self.live_leases.fetch_add(1, Ordering::Relaxed);
        self.state_counts[LeaseState::None.as_index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Records a coordinator retiring from the given state.
    pub fn coordinator_retired(&self, state: LeaseState) {
        self.live_leases.fetch_sub(1, Ordering::Relaxed);
        self.state_counts[state.as_index()].fetch_sub(1, Ordering::Relaxed);
    }

    /// Records a coordinator state transition.
    pub fn transition(&self, from: LeaseState, to: LeaseState) {
        if from == to {
            return;
        }
        self.state_counts[from.as_index()].fetch_sub(1, Ordering::Relaxed);
        self.state_counts[to.as_index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Current number of live coordinators.
    pub fn live(&self) -> usize {
        self.live_leases.load(Ordering::Relaxed)
    }

    /// Current number of leases in the given state.
    pub fn state_count(&self, state: LeaseState) -> usize {
        self.state_counts[state.as_index()].load(Ordering::Relaxed)
    }

    /// Records a grant reply.
    pub fn record_grant(&self) {
        self.grants.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a release reply.
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a denial reply.
    pub fn record_denial(&self) {
        self.denials.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one interrupt callback delivery attempt.
    pub fn record_interrupt_sent(&self) {
        self.interrupts_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a revocation episode ending in forced expiry.
    pub fn record_interrupt_expiry(&self) {
        self.interrupt_expiries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a synthetic eviction being issued.
    pub fn record_eviction_requested(&self) {
        self.evictions_requested.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an interrupt callback that could not be delivered.
    pub fn record_callback_drop(&self) {
        self.callback_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a queued waiter removed after cancellation.
    pub fn record_cancelled_waiter(&self) {
        self.cancelled_waiters.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            live_leases: self.live(),
            state_counts: LeaseState::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), self.state_count(*s)))
                .collect(),
            grants: self.grants.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            interrupts_sent: self.interrupts_sent.load(Ordering::Relaxed),
            interrupt_expiries: self.interrupt_expiries.load(Ordering::Relaxed),
            evictions_requested: self.evictions_requested.load(Ordering::Relaxed),
            callback_drops: self.callback_drops.load(Ordering::Relaxed),
            cancelled_waiters: self.cancelled_waiters.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_lifecycle_counts() {
        let metrics = LeaseMetrics::new();
        assert_eq!(metrics.live(), 0);

        metrics.coordinator_started();
        metrics.coordinator_started();
        assert_eq!(metrics.live(), 2);
        assert_eq!(metrics.state_count(LeaseState::None), 2);

        metrics.coordinator_retired(LeaseState::None);
        assert_eq!(metrics.live(), 1);
        assert_eq!(metrics.state_count(LeaseState::None), 1);
    }

    #[test]
    fn test_transition_moves_counts() {
        let metrics = LeaseMetrics::new();
        metrics.coordinator_started();

        metrics.transition(LeaseState::None, LeaseState::SharedGrantedRecently);
        assert_eq!(metrics.state_count(LeaseState::None), 0);
        assert_eq!(metrics.state_count(LeaseState::SharedGrantedRecently), 1);

        metrics.transition(
            LeaseState::SharedGrantedRecently,
            LeaseState::SharedGrantedLongAgo,
        );
        assert_eq!(metrics.state_count(LeaseState::SharedGrantedLongAgo), 1);
    }

    #[test]
    fn test_transition_same_state_noop() {
        let metrics = LeaseMetrics::new();
        metrics.coordinator_started();
        metrics.transition(LeaseState::None, LeaseState::None);
        assert_eq!(metrics.state_count(LeaseState::None), 1);
    }

    #[test]
    fn test_snapshot_covers_all_states() {
        let metrics = LeaseMetrics::new();
        metrics.record_grant();
        metrics.record_interrupt_sent();
        let snap = metrics.snapshot();
        assert_eq!(snap.state_counts.len(), LeaseState::COUNT);
        assert_eq!(snap.grants, 1);
        assert_eq!(snap.interrupts_sent, 1);
    }
}

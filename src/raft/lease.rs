//! Leader lease: proves via per-follower last-contact times that a quorum
//! still considers this node leader, so it can answer linearizable reads
//! without a round trip (spec.md §4.4). Grounded on QuarkDB
//! `RaftLease.hh`/`.cc` (`RaftLastContact`, quorum-th-smallest deadline).

use crate::common::NodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A handle a replicator task calls into after every successful heartbeat
/// or append, so the lease can be recomputed.
pub struct LastContact {
    node: NodeId,
    lease: std::sync::Arc<Lease>,
}

impl LastContact {
    pub fn heartbeat(&self, broadcast_time: Instant) {
        self.lease.record_contact(&self.node, broadcast_time);
    }
}

struct LeaseState {
    last_contact: HashMap<NodeId, Instant>,
    deadline: Instant,
}

pub struct Lease {
    lease_duration: Duration,
    quorum_size: Mutex<usize>,
    state: Mutex<LeaseState>,
}

impl Lease {
    pub fn new(lease_duration: Duration, quorum_size: usize) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            lease_duration,
            quorum_size: Mutex::new(quorum_size),
            state: Mutex::new(LeaseState {
                last_contact: HashMap::new(),
                deadline: Instant::now() + lease_duration,
            }),
        })
    }

    /// Returns a handle the replicator for `node` uses to report
    /// successful contact. `self: &Arc<Self>` so the handle can outlive any
    /// single borrow of the lease.
    pub fn handler(self: &std::sync::Arc<Self>, node: NodeId) -> LastContact {
        LastContact { node, lease: self.clone() }
    }

    /// Called when the voting membership changes, to keep `quorumSize`
    /// current and drop stale entries for removed followers.
    pub fn update_targets(&self, quorum_size: usize, voting_nodes: &[NodeId]) {
        *self.quorum_size.lock() = quorum_size;
        let mut state = self.state.lock();
        state.last_contact.retain(|node, _| voting_nodes.contains(node));
        Self::recompute(&mut state, *self.quorum_size.lock(), self.lease_duration);
    }

    fn record_contact(&self, node: &NodeId, broadcast_time: Instant) {
        let mut state = self.state.lock();
        let entry = state.last_contact.entry(node.clone()).or_insert(broadcast_time);
        if broadcast_time > *entry {
            *entry = broadcast_time;
        }
        let quorum_size = *self.quorum_size.lock();
        Self::recompute(&mut state, quorum_size, self.lease_duration);
    }

    /// Sorts the voting followers' last-contact times and picks the
    /// `(N - quorumSize + 1)`-th element — the freshest time such that a
    /// quorum including the leader has heartbeated at least that recently.
    /// For a 1-node cluster the deadline is simply `now + leaseDuration`.
    fn recompute(state: &mut LeaseState, quorum_size: usize, lease_duration: Duration) {
        if quorum_size <= 1 {
            state.deadline = Instant::now() + lease_duration;
            return;
        }
        let mut times: Vec<Instant> = state.last_contact.values().copied().collect();
        if times.len() + 1 < quorum_size {
            // Not enough followers have reported yet to reach quorum.
            return;
        }
        times.sort();
        let idx_from_end = quorum_size - 1;
        if idx_from_end > times.len() {
            // Not enough followers have reported yet to reach quorum.
            return;
        }
        let threshold = times[times.len() - idx_from_end];
        state.deadline = threshold + lease_duration;
    }

    pub fn deadline(&self) -> Instant {
        self.state.lock().deadline
    }

    pub fn is_valid(&self, now: Instant) -> bool {
        now <= self.deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_cluster_lease_is_always_near_now() {
        let lease = Lease::new(Duration::from_secs(2), 1);
        let before = Instant::now();
        assert!(lease.deadline() >= before);
    }

    #[test]
    fn three_node_cluster_needs_one_follower_contact_for_quorum() {
        let lease = Lease::new(Duration::from_secs(2), 2);
        let handler = lease.handler("b:2".to_string());
        let t = Instant::now();
        handler.heartbeat(t);
        assert!(lease.deadline() >= t + Duration::from_secs(2) - Duration::from_millis(50));
    }

    #[test]
    fn lease_deadline_advances_with_fresher_contact() {
        let lease = Lease::new(Duration::from_secs(2), 2);
        let handler = lease.handler("b:2".to_string());
        handler.heartbeat(Instant::now());
        let first_deadline = lease.deadline();
        std::thread::sleep(Duration::from_millis(5));
        handler.heartbeat(Instant::now());
        assert!(lease.deadline() >= first_deadline);
    }

    #[test]
    fn is_valid_respects_deadline() {
        let lease = Lease::new(Duration::from_millis(10), 1);
        assert!(lease.is_valid(Instant::now()));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!lease.is_valid(Instant::now()));
    }
}

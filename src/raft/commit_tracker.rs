//! Computes the cluster-wide commit index from per-follower match indices
//! (spec.md §4.5). Grounded on QuarkDB `RaftCommitTracker.cc`
//! (`RaftMatchIndexTracker::update`, `recalculateCommitIndex`,
//! `runAutoCommit` for single-node clusters).

use crate::common::NodeId;
use crate::raft::journal::Journal;
use crate::raft::types::LogIndex;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-follower match-index handle. Rejects retrograde updates — a
/// follower's confirmed replication point never moves backward within a
/// term.
pub struct MatchIndexTracker {
    node: NodeId,
    tracker: Arc<CommitTracker>,
}

impl MatchIndexTracker {
    /// Updates this follower's match index and recomputes the commit
    /// index. Panics on a retrograde update, mirroring QuarkDB's
    /// `RaftMatchIndexTracker::update`, which throws.
    pub fn update(&self, new_match_index: LogIndex) {
        self.tracker.update_match_index(&self.node, new_match_index);
    }
}

pub struct CommitTracker {
    journal: Arc<Journal>,
    quorum_size: Mutex<usize>,
    match_indices: Mutex<HashMap<NodeId, LogIndex>>,
}

impl CommitTracker {
    pub fn new(journal: Arc<Journal>, quorum_size: usize) -> Arc<Self> {
        Arc::new(Self {
            journal,
            quorum_size: Mutex::new(quorum_size),
            match_indices: Mutex::new(HashMap::new()),
        })
    }

    pub fn handle(self: &Arc<Self>, node: NodeId) -> MatchIndexTracker {
        self.match_indices.lock().entry(node.clone()).or_insert(0);
        MatchIndexTracker { node, tracker: self.clone() }
    }

    pub fn update_targets(&self, quorum_size: usize, voting_nodes: &[NodeId]) {
        *self.quorum_size.lock() = quorum_size;
        let mut indices = self.match_indices.lock();
        indices.retain(|node, _| voting_nodes.contains(node));
        for node in voting_nodes {
            indices.entry(node.clone()).or_insert(0);
        }
    }

    fn update_match_index(&self, node: &NodeId, new_match_index: LogIndex) {
        let mut indices = self.match_indices.lock();
        let current = indices.entry(node.clone()).or_insert(0);
        if new_match_index < *current {
            panic!("match index for {node} went backward: {new_match_index} < {current}");
        }
        *current = new_match_index;
        drop(indices);
        self.recalculate_commit_index();
    }

    /// The `(N - quorumSize + 1)`-th largest match index, including an
    /// implicit `logSize-1` for the leader. If the new value is below the
    /// journal's current commit index, logs critical and refuses — never
    /// retrograde.
    fn recalculate_commit_index(&self) {
        let quorum_size = *self.quorum_size.lock();
        let leader_index = self.journal.log_size().saturating_sub(1);
        let mut indices: Vec<LogIndex> = self.match_indices.lock().values().copied().collect();
        indices.push(leader_index);
        indices.sort_unstable();
        if quorum_size == 0 || quorum_size > indices.len() {
            return;
        }
        let candidate = indices[indices.len() - quorum_size];
        let current_commit = self.journal.commit_index();
        if candidate < current_commit {
            tracing::error!(
                candidate,
                current_commit,
                "commit index would regress, entering lagging mode"
            );
            return;
        }
        if candidate > current_commit {
            match self.journal.set_commit_index(candidate) {
                Ok(true) => {}
                Ok(false) => tracing::warn!(candidate, "journal refused commit index advance"),
                Err(err) => tracing::error!(%err, "failed to advance commit index"),
            }
        }
    }

    /// Spawns the background task that force-advances the commit index to
    /// `logSize-1` for single-node clusters, where no external votes are
    /// ever needed (spec.md §8, Boundary behaviors).
    pub fn spawn_auto_committer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            loop {
                let current_size = tracker.journal.log_size();
                let commit_index = tracker.journal.commit_index();
                if current_size > 0 && commit_index + 1 < current_size {
                    let _ = tracker.journal.set_commit_index(current_size - 1);
                }
                tracker.journal.wait_for_updates(current_size, Duration::from_secs(1)).await;
                if *tracker.quorum_size.lock() != 1 {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsyncPolicy;
    use crate::raft::membership::Membership;
    use crate::raft::storage::MemoryStore;
    use crate::raft::types::{Command, LogEntry};
    use std::collections::BTreeSet;

    fn journal_with_members(nodes: &[&str]) -> Arc<Journal> {
        let members = Membership::new(nodes.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(), BTreeSet::new(), 0);
        Arc::new(Journal::open(Arc::new(MemoryStore::new()), "c1", members, FsyncPolicy::Always).unwrap())
    }

    #[test]
    fn quorum_commit_advances_once_majority_matches() {
        let journal = journal_with_members(&["a:1", "b:2", "c:3"]);
        journal.append(1, LogEntry::new(0, Command::Data(vec![]))).unwrap();
        journal.append(2, LogEntry::new(0, Command::Data(vec![]))).unwrap();
        let tracker = CommitTracker::new(journal.clone(), 2);
        let b = tracker.handle("b:2".to_string());
        let c = tracker.handle("c:3".to_string());
        b.update(1);
        assert_eq!(journal.commit_index(), 0);
        c.update(2);
        assert_eq!(journal.commit_index(), 2);
    }

    #[test]
    #[should_panic(expected = "went backward")]
    fn retrograde_match_index_panics() {
        let journal = journal_with_members(&["a:1", "b:2"]);
        let tracker = CommitTracker::new(journal, 2);
        let handle = tracker.handle("b:2".to_string());
        handle.update(3);
        handle.update(1);
    }

    #[tokio::test]
    async fn single_node_cluster_auto_commits() {
        let journal = journal_with_members(&["a:1"]);
        journal.append(1, LogEntry::new(0, Command::Data(vec![]))).unwrap();
        let tracker = CommitTracker::new(journal.clone(), 1);
        tracker.spawn_auto_committer();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(journal.commit_index(), 1);
    }
}

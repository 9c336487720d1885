//! The atomic `(term, role, recognizedLeader, votedFor, leadershipMarker)`
//! tuple, published as an immutable snapshot (spec.md §4.2).
//!
//! Grounded on QuarkDB `RaftState.hh`/`.cc` (`RaftStateSnapshot`,
//! `observed`/`grantVote`/`ascend`/`becomeCandidate`/`dropOut`/`shutdown`)
//! and the `RaftStateData` + `RwLock` idiom from
//! `networking/membership/raft/mod.rs`.

use crate::common::NodeId;
use crate::error::Result;
use crate::raft::journal::Journal;
use crate::raft::membership::Membership;
use crate::raft::types::{LogIndex, Term, BLOCKED_VOTE};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::timeout as tokio_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

/// An immutable point-in-time view of node state. Any reader observes a
/// consistent tuple, never a partially-updated one (spec.md §5).
#[derive(Debug, Clone)]
pub struct RaftStateSnapshot {
    pub term: Term,
    pub role: Role,
    pub leader: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub leadership_marker: Option<LogIndex>,
    pub created_at: Instant,
}

impl RaftStateSnapshot {
    fn initial() -> Self {
        Self {
            term: 0,
            role: Role::Follower,
            leader: None,
            voted_for: None,
            leadership_marker: None,
            created_at: Instant::now(),
        }
    }
}

/// The node's raft role machine, backed by the journal for durability.
pub struct NodeState {
    node_id: NodeId,
    journal: Arc<Journal>,
    snapshot: RwLock<Arc<RaftStateSnapshot>>,
    notifier: Notify,
}

impl NodeState {
    pub fn new(node_id: NodeId, journal: Arc<Journal>) -> Self {
        let term = journal.current_term();
        let voted_for = journal.voted_for();
        let snapshot = RaftStateSnapshot {
            term,
            voted_for,
            ..RaftStateSnapshot::initial()
        };
        Self {
            node_id,
            journal,
            snapshot: RwLock::new(Arc::new(snapshot)),
            notifier: Notify::new(),
        }
    }

    pub fn get_snapshot(&self) -> Arc<RaftStateSnapshot> {
        self.snapshot.read().clone()
    }

    fn publish(&self, next: RaftStateSnapshot) {
        *self.snapshot.write() = Arc::new(next);
        self.notifier.notify_waiters();
    }

    /// If `term > currentTerm`: step down to FOLLOWER, clear votedFor,
    /// adopt `leader`. If `leader` is non-empty, block further votes this
    /// term. If `term == currentTerm` and leader was unknown: adopt it,
    /// also blocking further votes.
    pub fn observed(&self, term: Term, leader: Option<NodeId>) -> Result<bool> {
        let current = self.get_snapshot();
        if term < current.term {
            return Ok(false);
        }
        if term > current.term {
            let blocked_vote = leader.as_ref().map(|_| BLOCKED_VOTE.to_string());
            self.journal.set_current_term(term, blocked_vote.clone())?;
            tracing::info!(node_id = %self.node_id, term, ?leader, "observed higher term, stepping down");
            self.publish(RaftStateSnapshot {
                term,
                role: Role::Follower,
                leader: leader.clone(),
                voted_for: blocked_vote,
                leadership_marker: None,
                created_at: Instant::now(),
            });
            return Ok(true);
        }
        if current.leader.is_none() && leader.is_some() {
            self.journal.set_current_term(term, Some(BLOCKED_VOTE.to_string()))?;
            tracing::info!(node_id = %self.node_id, term, ?leader, "observed leader for current term");
            self.publish(RaftStateSnapshot {
                leader,
                voted_for: Some(BLOCKED_VOTE.to_string()),
                created_at: current.created_at,
                ..(*current).clone()
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// Allowed only if FOLLOWER, term matches, no leader recognized,
    /// votedFor still empty.
    pub fn grant_vote(&self, term: Term, candidate: &NodeId) -> Result<bool> {
        let current = self.get_snapshot();
        if current.role != Role::Follower || current.term != term || current.leader.is_some() || current.voted_for.is_some() {
            return Ok(false);
        }
        self.journal.set_current_term(term, Some(candidate.clone()))?;
        tracing::info!(node_id = %self.node_id, term, candidate, "granting vote");
        self.publish(RaftStateSnapshot {
            voted_for: Some(candidate.clone()),
            created_at: current.created_at,
            ..(*current).clone()
        });
        Ok(true)
    }

    /// FOLLOWER -> CANDIDATE for `term`; requires no recognized leader, no
    /// prior vote, and membership inclusion. Votes for self.
    pub fn become_candidate(&self, term: Term, membership: &Membership) -> Result<bool> {
        let current = self.get_snapshot();
        if current.role != Role::Follower || current.leader.is_some() || current.voted_for.is_some() {
            return Ok(false);
        }
        if !membership.is_voting_member(&self.node_id) {
            return Ok(false);
        }
        self.journal.set_current_term(term, Some(self.node_id.clone()))?;
        tracing::info!(node_id = %self.node_id, term, "becoming candidate");
        self.publish(RaftStateSnapshot {
            term,
            role: Role::Candidate,
            leader: None,
            voted_for: Some(self.node_id.clone()),
            leadership_marker: None,
            created_at: Instant::now(),
        });
        Ok(true)
    }

    /// CANDIDATE -> LEADER; appends a leadership marker and records its
    /// index.
    pub fn ascend(&self, term: Term) -> Result<bool> {
        let current = self.get_snapshot();
        if current.role != Role::Candidate || current.term != term {
            return Ok(false);
        }
        let index = self.journal.log_size();
        if !self.journal.append_leadership_marker(index, term, self.node_id.clone())? {
            return Ok(false);
        }
        tracing::info!(node_id = %self.node_id, term, marker_index = index, "ascending to leader");
        self.publish(RaftStateSnapshot {
            role: Role::Leader,
            leader: Some(self.node_id.clone()),
            leadership_marker: Some(index),
            created_at: Instant::now(),
            ..(*current).clone()
        });
        Ok(true)
    }

    /// CANDIDATE -> FOLLOWER (lost election).
    pub fn drop_out(&self, term: Term) {
        let current = self.get_snapshot();
        if current.role == Role::Candidate && current.term == term {
            tracing::info!(node_id = %self.node_id, term, "dropping out of candidacy");
            self.publish(RaftStateSnapshot {
                role: Role::Follower,
                created_at: current.created_at,
                ..(*current).clone()
            });
        }
    }

    pub fn shutdown(&self) {
        let current = self.get_snapshot();
        tracing::info!(node_id = %self.node_id, "shutting down");
        self.publish(RaftStateSnapshot {
            role: Role::Shutdown,
            created_at: current.created_at,
            ..(*current).clone()
        });
    }

    /// Condition-variable-style wait that short-circuits on shutdown or a
    /// role/term change.
    pub async fn wait(&self, duration: Duration) {
        if self.get_snapshot().role == Role::Shutdown {
            return;
        }
        let notified = self.notifier.notified();
        tokio::pin!(notified);
        let _ = tokio_timeout(duration, notified).await;
    }

    pub async fn wait_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            self.wait(deadline - now).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsyncPolicy;
    use crate::raft::storage::MemoryStore;
    use std::collections::BTreeSet;

    fn journal() -> Arc<Journal> {
        let members = Membership::new(
            ["a:1", "b:2", "c:3"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            BTreeSet::new(),
            0,
        );
        Arc::new(Journal::open(Arc::new(MemoryStore::new()), "c1", members, FsyncPolicy::Always).unwrap())
    }

    #[test]
    fn become_candidate_requires_membership() {
        let journal = journal();
        let state = NodeState::new("z:9".to_string(), journal);
        assert!(!state.become_candidate(1, &state_membership()).unwrap());
    }

    fn state_membership() -> Membership {
        Membership::new(
            ["a:1", "b:2", "c:3"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            BTreeSet::new(),
            0,
        )
    }

    #[test]
    fn candidate_to_leader_to_follower_lifecycle() {
        let journal = journal();
        let state = NodeState::new("a:1".to_string(), journal);
        assert!(state.become_candidate(1, &state_membership()).unwrap());
        assert_eq!(state.get_snapshot().role, Role::Candidate);
        assert!(state.ascend(1).unwrap());
        assert_eq!(state.get_snapshot().role, Role::Leader);
        assert!(state.get_snapshot().leadership_marker.is_some());
    }

    #[test]
    fn drop_out_returns_candidate_to_follower() {
        let journal = journal();
        let state = NodeState::new("a:1".to_string(), journal);
        state.become_candidate(1, &state_membership()).unwrap();
        state.drop_out(1);
        assert_eq!(state.get_snapshot().role, Role::Follower);
    }

    #[test]
    fn observed_higher_term_steps_down_and_blocks_vote_for_leader() {
        let journal = journal();
        let state = NodeState::new("b:2".to_string(), journal);
        assert!(state.observed(5, Some("a:1".to_string())).unwrap());
        let snap = state.get_snapshot();
        assert_eq!(snap.term, 5);
        assert_eq!(snap.role, Role::Follower);
        assert_eq!(snap.voted_for.as_deref(), Some(BLOCKED_VOTE));
    }

    #[test]
    fn grant_vote_refuses_second_vote_in_same_term() {
        let journal = journal();
        let state = NodeState::new("b:2".to_string(), journal);
        state.observed(1, None).unwrap();
        assert!(state.grant_vote(1, &"a:1".to_string()).unwrap());
        assert!(!state.grant_vote(1, &"c:3".to_string()).unwrap());
    }
}

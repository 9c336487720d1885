//! The outer control loop driving role transitions: follower waits for a
//! timeout then runs for leader; a leader replicates until its lease lapses
//! (spec.md §4.10). Grounded directly on QuarkDB `RaftDirector.cc`: `main`,
//! `followerLoop`, `leaderLoop`, `runForLeader`, `checkBasicSanity`.

use crate::common::NodeId;
use crate::config::RaftConfig;
use crate::error::{DbError, Result};
use crate::raft::election::{run_election, VoteOutcome};
use crate::raft::heartbeat::HeartbeatTracker;
use crate::raft::journal::Journal;
use crate::raft::lease::Lease;
use crate::raft::replicator::Replicator;
use crate::raft::rpc::RpcClient;
use crate::raft::state::{NodeState, RaftStateSnapshot, Role};
use crate::raft::write_tracker::WriteTracker;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

pub struct Director {
    node_id: NodeId,
    config: RaftConfig,
    journal: Arc<Journal>,
    state: Arc<NodeState>,
    heartbeat_tracker: Arc<HeartbeatTracker>,
    lease: Arc<Lease>,
    replicator: Arc<Replicator>,
    write_tracker: Arc<WriteTracker>,
    rpc: Arc<dyn RpcClient>,
    /// Timestamp of the last heartbeat as of the moment we were last
    /// vetoed. While unchanged, we abstain from running again, mirroring
    /// QuarkDB's `lastHeartbeatBeforeVeto` (spec.md §8, Scenario 3).
    last_heartbeat_before_veto: Mutex<Option<Instant>>,
}

impl Director {
    pub fn new(
        node_id: NodeId,
        config: RaftConfig,
        journal: Arc<Journal>,
        state: Arc<NodeState>,
        heartbeat_tracker: Arc<HeartbeatTracker>,
        lease: Arc<Lease>,
        replicator: Arc<Replicator>,
        write_tracker: Arc<WriteTracker>,
        rpc: Arc<dyn RpcClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            config,
            journal,
            state,
            heartbeat_tracker,
            lease,
            replicator,
            write_tracker,
            rpc,
            last_heartbeat_before_veto: Mutex::new(None),
        })
    }

    fn is_current(&self, snapshot: &Arc<RaftStateSnapshot>) -> bool {
        Arc::ptr_eq(&self.state.get_snapshot(), snapshot)
    }

    /// Runs until the node's role becomes `Shutdown`. Intended to be
    /// spawned once per process onto its own task.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.heartbeat_tracker.refresh_random_timeout();
            let snapshot = self.state.get_snapshot();
            match snapshot.role {
                Role::Shutdown => return,
                Role::Leader => {
                    self.leader_loop(snapshot).await;
                    self.heartbeat_tracker.heartbeat(Instant::now());
                }
                Role::Follower | Role::Candidate => {
                    self.follower_loop(snapshot).await;
                }
            }
        }
    }

    async fn follower_loop(&self, snapshot: Arc<RaftStateSnapshot>) {
        while self.is_current(&snapshot) {
            self.write_tracker.flush_all(DbError::Unavailable("not the leader".to_string()));

            let timeout = self.heartbeat_tracker.current_timeout();
            self.state.wait(timeout).await;
            if !self.is_current(&snapshot) {
                return;
            }

            let last_heartbeat = self.heartbeat_tracker.last_heartbeat();
            if *self.last_heartbeat_before_veto.lock() == Some(last_heartbeat) {
                tracing::debug!(node_id = %self.node_id, "abstaining: vetoed and no fresh heartbeat since");
                continue;
            }

            if !self.heartbeat_tracker.timeout(Instant::now()) {
                continue;
            }

            let membership = self.journal.membership();
            if membership.in_limbo() {
                tracing::warn!(node_id = %self.node_id, "in limbo, no known cluster members");
                continue;
            }
            if !membership.is_voting_member(&self.node_id) {
                tracing::debug!(node_id = %self.node_id, "observer, not eligible to run for leader");
                continue;
            }

            if let Err(err) = self.run_for_leader(&snapshot, &membership).await {
                tracing::error!(node_id = %self.node_id, %err, "election attempt failed");
            }
            return;
        }
    }

    /// Pre-vote probe, then (if the probe looks electable) a real vote
    /// round that actually advances the term.
    async fn run_for_leader(
        &self,
        snapshot: &Arc<RaftStateSnapshot>,
        membership: &crate::raft::membership::Membership,
    ) -> Result<()> {
        let deadline = self.config.heartbeat_interval * 2;
        let prospective_term = snapshot.term + 1;

        let (pre_outcome, _) = run_election(&self.node_id, membership, &self.journal, &self.rpc, prospective_term, true, deadline).await;
        if pre_outcome == VoteOutcome::Vetoed {
            *self.last_heartbeat_before_veto.lock() = Some(self.heartbeat_tracker.last_heartbeat());
        }
        if pre_outcome != VoteOutcome::Elected {
            return Ok(());
        }

        if !self.state.become_candidate(prospective_term, membership)? {
            return Ok(());
        }

        let (outcome, registry) = run_election(&self.node_id, membership, &self.journal, &self.rpc, prospective_term, false, deadline).await;
        registry.observe_terms_and_leases(&self.state, &self.lease, Instant::now())?;

        match outcome {
            VoteOutcome::Elected => {
                self.state.ascend(prospective_term)?;
            }
            VoteOutcome::Vetoed => {
                *self.last_heartbeat_before_veto.lock() = Some(self.heartbeat_tracker.last_heartbeat());
                self.state.drop_out(prospective_term);
            }
            VoteOutcome::NotElected => {
                self.state.drop_out(prospective_term);
            }
        }
        Ok(())
    }

    /// `commitIndex <= logSize` and `lastApplied <= commitIndex`: the two
    /// preconditions a node must satisfy before it is safe to replicate as
    /// leader (spec.md §4.10).
    fn check_basic_sanity(&self) -> bool {
        self.journal.commit_index() <= self.journal.log_size() && self.write_tracker.last_applied() <= self.journal.commit_index()
    }

    async fn leader_loop(&self, snapshot: Arc<RaftStateSnapshot>) {
        if !self.check_basic_sanity() {
            tracing::error!(node_id = %self.node_id, "refusing to lead: basic sanity check failed");
            self.state.drop_out(snapshot.term);
            return;
        }

        self.replicator.activate(snapshot.clone());

        while self.is_current(&snapshot) {
            let deadline = self.lease.deadline();
            if deadline < Instant::now() {
                tracing::warn!(node_id = %self.node_id, term = snapshot.term, "lease expired, stepping down");
                if let Err(err) = self.state.observed(snapshot.term + 1, None) {
                    tracing::error!(%err, "failed to record step-down");
                }
                self.write_tracker.flush_all(DbError::Unavailable("lease expired, stepped down".to_string()));
                break;
            }
            self.state.wait_until(deadline).await;
        }

        self.replicator.deactivate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsyncPolicy;
    use crate::raft::commit_tracker::CommitTracker;
    use crate::raft::election::{VoteRequest, VoteResponse};
    use crate::raft::membership::Membership;
    use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, HeartbeatRequest, HeartbeatResponse};
    use crate::raft::storage::MemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::time::Duration;

    struct SoloRpc;

    #[async_trait]
    impl RpcClient for SoloRpc {
        async fn request_vote(&self, _peer: &NodeId, request: VoteRequest, _deadline: Duration) -> Result<VoteResponse> {
            Ok(VoteResponse { term: request.term, reply: crate::raft::election::VoteReply::Granted })
        }
        async fn heartbeat(&self, _peer: &NodeId, request: HeartbeatRequest, _deadline: Duration) -> Result<HeartbeatResponse> {
            Ok(HeartbeatResponse { term: request.term, recognized_as_leader: true, err: None })
        }
        async fn append_entries(&self, _peer: &NodeId, request: AppendEntriesRequest, _deadline: Duration) -> Result<AppendEntriesResponse> {
            Ok(AppendEntriesResponse { term: request.term, log_size: request.prev_index + 1, success: true, err: None })
        }
    }

    fn single_node_director() -> Arc<Director> {
        let members = Membership::new(["a:1"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(), BTreeSet::new(), 0);
        let journal = Arc::new(Journal::open(Arc::new(MemoryStore::new()), "c1", members, FsyncPolicy::Always).unwrap());
        let state = Arc::new(NodeState::new("a:1".to_string(), journal.clone()));
        let mut config = RaftConfig::default();
        config.election_timeout_min = Duration::from_millis(10);
        config.election_timeout_max = Duration::from_millis(20);
        config.heartbeat_interval = Duration::from_millis(5);
        config.lease_duration = Duration::from_millis(50);
        let heartbeat_tracker = Arc::new(HeartbeatTracker::new(config.clone()));
        let lease = Lease::new(config.lease_duration, 1);
        let commit_tracker = CommitTracker::new(journal.clone(), 1);
        let rpc: Arc<dyn RpcClient> = Arc::new(SoloRpc);
        let replicator = Replicator::new("a:1".to_string(), config.clone(), journal.clone(), state.clone(), rpc.clone(), commit_tracker.clone(), lease.clone());
        let sm: Arc<dyn crate::state_machine::StateMachine> = Arc::new(crate::state_machine::InMemoryStateMachine::new());
        let write_tracker = WriteTracker::new(journal.clone(), sm);
        write_tracker.spawn_applier();
        Director::new("a:1".to_string(), config, journal, state, heartbeat_tracker, lease, replicator, write_tracker, rpc)
    }

    #[tokio::test]
    async fn single_node_cluster_elects_itself_leader() {
        let director = single_node_director();
        let state = director.state.clone();
        tokio::spawn(director.run());
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if state.get_snapshot().role == Role::Leader {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

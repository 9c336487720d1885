//! The façade every incoming request passes through: handshake
//! authorization, raft RPC handlers, and the leader/follower routing table
//! for reads, writes, membership changes, and admin commands (spec.md
//! §4.8). Grounded directly on QuarkDB's dispatch table, `RaftCommon.hh`'s
//! `RaftInfo`, and `RaftDirector.cc`'s `Formatter::err(...)` usages for the
//! error-shape conventions; the per-connection authorization map follows
//! the `DashMap`-keyed connection state from `common/concurrent_map.rs`.

use crate::common::NodeId;
use crate::config::{FsyncPolicy, RaftConfig};
use crate::error::{DbError, Result};
use crate::raft::commit_tracker::CommitTracker;
use crate::raft::election::{evaluate_vote_request, VoteReply, VoteRequest, VoteResponse};
use crate::raft::heartbeat::HeartbeatTracker;
use crate::raft::journal::Journal;
use crate::raft::lease::Lease;
use crate::raft::membership::Membership;
use crate::raft::replicator::{ReplicaStatus, Replicator};
use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, HeartbeatRequest, HeartbeatResponse, RpcClient};
use crate::raft::state::{NodeState, Role};
use crate::raft::types::{Command, LogEntry, LogIndex, Term};
use crate::raft::write_tracker::WriteTracker;
use crate::state_machine::{Reply, StateMachine};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

/// Identifies one client/peer connection for authorization and pending-
/// write bookkeeping. The connection lifecycle itself (accept loop, framing)
/// is an external collaborator (spec.md §1).
pub type ConnectionId = u64;

/// Snapshot of cluster health for `RAFT_INFO`. Grounded on QuarkDB's
/// `RaftInfo` struct (`RaftCommon.hh`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftInfo {
    pub node_id: NodeId,
    pub term: Term,
    pub role: String,
    pub leader: Option<NodeId>,
    pub log_start: LogIndex,
    pub log_size: LogIndex,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub membership: String,
    pub membership_epoch: u64,
    pub shaky_quorum: bool,
    pub lease_valid: bool,
    pub replicas: Vec<ReplicaStatus>,
}

fn canonical_handshake_timeouts(config: &RaftConfig) -> String {
    format!(
        "heartbeat_ms={},low_ms={},high_ms={}",
        config.heartbeat_interval.as_millis(),
        config.election_timeout_min.as_millis(),
        config.election_timeout_max.as_millis()
    )
}

/// Stands in for the concrete command language (spec.md §1, out of scope):
/// a single reserved token is treated as the time-dependent marker the
/// lease filter substitutes with the state machine's dynamic clock, so
/// every replica applies identical wall-time semantics for the same entry.
const DYNAMIC_CLOCK_TOKEN: &[u8] = b"\0NOW\0";

pub struct Dispatcher {
    node_id: NodeId,
    cluster_id: String,
    config: RaftConfig,
    journal: Arc<Journal>,
    state: Arc<NodeState>,
    heartbeat_tracker: Arc<HeartbeatTracker>,
    lease: Arc<Lease>,
    commit_tracker: Arc<CommitTracker>,
    replicator: Arc<Replicator>,
    write_tracker: Arc<WriteTracker>,
    state_machine: Arc<dyn StateMachine>,
    rpc: Arc<dyn RpcClient>,
    authorized: DashMap<ConnectionId, bool>,
    stale_reads: AtomicBool,
    /// Serializes raft-log-mutating operations: client writes and
    /// membership changes both append to the journal and must not
    /// interleave at the same index (spec.md §5, "raftCommand").
    raft_command: AsyncMutex<()>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        cluster_id: String,
        config: RaftConfig,
        journal: Arc<Journal>,
        state: Arc<NodeState>,
        heartbeat_tracker: Arc<HeartbeatTracker>,
        lease: Arc<Lease>,
        commit_tracker: Arc<CommitTracker>,
        replicator: Arc<Replicator>,
        write_tracker: Arc<WriteTracker>,
        state_machine: Arc<dyn StateMachine>,
        rpc: Arc<dyn RpcClient>,
    ) -> Arc<Self> {
        let stale_reads = AtomicBool::new(config.stale_reads);
        Arc::new(Self {
            node_id,
            cluster_id,
            config,
            journal,
            state,
            heartbeat_tracker,
            lease,
            commit_tracker,
            replicator,
            write_tracker,
            state_machine,
            rpc,
            authorized: DashMap::new(),
            stale_reads,
            raft_command: AsyncMutex::new(()),
        })
    }

    // ---- Handshake -------------------------------------------------

    /// First operation required on any inter-node connection. Mismatched
    /// cluster id or timeout string closes the link and blocks further
    /// raft RPCs on it (spec.md §4.8).
    pub fn handshake(&self, connection: ConnectionId, cluster_id: &str, timeouts: &str) -> Result<()> {
        let expected = canonical_handshake_timeouts(&self.config);
        if cluster_id != self.cluster_id || timeouts != expected {
            self.authorized.insert(connection, false);
            return Err(DbError::NotAuthorized(format!(
                "handshake mismatch: cluster_id or timeouts did not match (expected timeouts {expected})"
            )));
        }
        self.authorized.insert(connection, true);
        Ok(())
    }

    pub fn require_authorized(&self, connection: ConnectionId) -> Result<()> {
        if self.authorized.get(&connection).map(|v| *v).unwrap_or(false) {
            Ok(())
        } else {
            Err(DbError::NotAuthorized("raft RPC attempted before a successful handshake".to_string()))
        }
    }

    pub fn notify_disconnect(&self, connection: ConnectionId) {
        self.authorized.remove(&connection);
        self.write_tracker.flush_connection(connection, DbError::Unavailable("connection closed".to_string()));
    }

    // ---- Raft RPC handlers ------------------------------------------

    pub fn handle_heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let snapshot = self.state.get_snapshot();
        if request.term < snapshot.term {
            return Ok(HeartbeatResponse { term: snapshot.term, recognized_as_leader: false, err: Some("stale term".to_string()) });
        }
        self.state.observed(request.term, Some(request.leader))?;
        self.heartbeat_tracker.heartbeat(Instant::now());
        self.heartbeat_tracker.refresh_random_timeout();
        Ok(HeartbeatResponse { term: request.term, recognized_as_leader: true, err: None })
    }

    /// Mirrors the conflict-rollback idiom in
    /// `networking/membership/raft/replication.rs`'s `handle_append_entries`,
    /// expressed against this crate's `Journal` contract instead of
    /// `RaftLog`.
    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let snapshot = self.state.get_snapshot();
        if request.term < snapshot.term {
            return Ok(AppendEntriesResponse {
                term: snapshot.term,
                log_size: self.journal.log_size(),
                success: false,
                err: Some("stale term".to_string()),
            });
        }
        self.state.observed(request.term, Some(request.leader))?;
        self.heartbeat_tracker.heartbeat(Instant::now());
        self.heartbeat_tracker.refresh_random_timeout();

        if request.prev_index > 0 && !self.journal.match_entries(request.prev_index, request.prev_term) {
            return Ok(AppendEntriesResponse {
                term: request.term,
                log_size: self.journal.log_size(),
                success: false,
                err: Some("log entry mismatch".to_string()),
            });
        }

        let conflict_at = self.journal.compare_entries(request.prev_index + 1, &request.entries);
        if conflict_at < self.journal.log_size() {
            tracing::debug!(conflict_at, "append-entries conflicts with existing suffix, truncating");
            self.journal.remove_entries(conflict_at)?;
        }
        for (offset, entry) in request.entries.into_iter().enumerate() {
            let index = request.prev_index + 1 + offset as LogIndex;
            if index >= self.journal.log_size() {
                self.journal.append(index, entry)?;
            }
        }

        let new_commit = request.commit_index.min(self.journal.log_size().saturating_sub(1));
        if new_commit > self.journal.commit_index() {
            self.journal.set_commit_index(new_commit)?;
        }

        Ok(AppendEntriesResponse { term: request.term, log_size: self.journal.log_size(), success: true, err: None })
    }

    pub fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let snapshot = self.state.get_snapshot();
        if !request.pre_vote && request.term > snapshot.term {
            self.state.observed(request.term, None)?;
        }
        let response = evaluate_vote_request(&request, &self.state, &self.journal, &self.journal.membership());
        if !request.pre_vote && response.reply == VoteReply::Granted {
            self.state.grant_vote(response.term, &request.candidate_id)?;
        }
        Ok(response)
    }

    // ---- Write path ---------------------------------------------------

    fn lease_filter(&self, tokens: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let clock = self.state_machine.dynamic_clock();
        tokens
            .into_iter()
            .map(|token| if token == DYNAMIC_CLOCK_TOKEN { clock.to_string().into_bytes() } else { token })
            .collect()
    }

    fn redirect_or_unavailable(&self, snapshot: &crate::raft::state::RaftStateSnapshot) -> DbError {
        match &snapshot.leader {
            Some(leader) if leader != &self.node_id => DbError::Moved(leader.clone()),
            _ => DbError::Unavailable("no leader known".to_string()),
        }
    }

    /// Appends the write under the `raftCommand` critical section, then
    /// waits for the write tracker to report its commit-time reply.
    pub async fn dispatch_write(&self, connection: ConnectionId, tokens: Vec<Vec<u8>>) -> Result<Reply> {
        let snapshot = self.state.get_snapshot();
        if snapshot.role != Role::Leader {
            return Err(self.redirect_or_unavailable(&snapshot));
        }

        let filtered = self.lease_filter(tokens);
        let guard = self.raft_command.lock().await;
        let snapshot = self.state.get_snapshot();
        if snapshot.role != Role::Leader {
            return Err(self.redirect_or_unavailable(&snapshot));
        }
        let index = self.journal.log_size();
        let entry = LogEntry::new(snapshot.term, Command::Data(filtered));
        let appended = self.journal.append(index, entry)?;
        drop(guard);
        if !appended {
            return Err(DbError::Unavailable("term changed while appending, retry".to_string()));
        }

        let rx = self.write_tracker.track(connection, index);
        rx.await.map_err(|_| DbError::Unavailable("dropped before the write could be applied".to_string()))?
    }

    // ---- Read path ------------------------------------------------------

    /// Leaders wait for the applier to catch up past their own leadership
    /// marker before answering a read, so a freshly elected leader never
    /// serves state committed under a previous term but not yet applied
    /// locally (spec.md §4.8).
    pub async fn dispatch_read(&self, tokens: &[Vec<u8>]) -> Result<Reply> {
        let snapshot = self.state.get_snapshot();
        match snapshot.role {
            Role::Leader => {
                if let Some(marker) = snapshot.leadership_marker {
                    let deadline = Instant::now() + self.config.heartbeat_interval * 20;
                    while self.write_tracker.last_applied() < marker {
                        if Instant::now() > deadline {
                            return Err(DbError::Unavailable("still catching up after election".to_string()));
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
                self.state_machine.read(tokens).await
            }
            Role::Follower if self.stale_reads.load(Ordering::Relaxed) => self.state_machine.read(tokens).await,
            Role::Follower => Err(self.redirect_or_unavailable(&snapshot)),
            _ => Err(DbError::Unavailable("not ready to serve reads".to_string())),
        }
    }

    // ---- Membership changes ---------------------------------------------

    async fn membership_guarded<F>(&self, f: F) -> Result<Reply>
    where
        F: FnOnce(&Dispatcher, Term) -> Result<bool>,
    {
        let snapshot = self.state.get_snapshot();
        if snapshot.role != Role::Leader {
            return Err(self.redirect_or_unavailable(&snapshot));
        }
        let _guard = self.raft_command.lock().await;
        let snapshot = self.state.get_snapshot();
        if snapshot.role != Role::Leader {
            return Err(self.redirect_or_unavailable(&snapshot));
        }
        if !f(self, snapshot.term)? {
            return Err(DbError::Unavailable("membership append was refused, retry".to_string()));
        }
        Ok(Reply::Ok)
    }

    pub async fn add_observer(&self, observer: NodeId) -> Result<Reply> {
        self.membership_guarded(|d, term| d.journal.add_observer(term, observer.clone())).await
    }

    pub async fn promote_observer(&self, observer: NodeId) -> Result<Reply> {
        let match_index = self.replicator.match_index_of(&observer).unwrap_or(0);
        self.membership_guarded(|d, term| d.journal.promote_observer(term, &observer, match_index)).await
    }

    /// Refuses if the replication status is too shaky to safely lose one
    /// more voter (spec.md §4.6, "shakyQuorum").
    pub async fn remove_member(&self, member: NodeId) -> Result<Reply> {
        if self.replicator.shaky_quorum() {
            return Err(DbError::MembershipBlocked("quorum is too shaky to remove a member right now".to_string()));
        }
        self.membership_guarded(|d, term| d.journal.remove_member(term, &member)).await
    }

    // ---- Admin ------------------------------------------------------

    /// Forces this node's election timer to fire on its next follower-loop
    /// iteration, prompting an immediate election attempt.
    pub fn attempt_coup(&self) {
        self.heartbeat_tracker.trigger_timeout();
    }

    pub fn set_fsync_policy(&self, policy: FsyncPolicy) {
        self.journal.set_fsync_policy(policy);
    }

    pub fn activate_stale_reads(&self, on: bool) {
        self.stale_reads.store(on, Ordering::Relaxed);
    }

    // ---- Introspection ------------------------------------------------

    pub fn raft_info(&self) -> RaftInfo {
        let snapshot = self.state.get_snapshot();
        let membership = self.journal.membership();
        RaftInfo {
            node_id: self.node_id.clone(),
            term: snapshot.term,
            role: format!("{:?}", snapshot.role),
            leader: snapshot.leader.clone(),
            log_start: self.journal.log_start(),
            log_size: self.journal.log_size(),
            commit_index: self.journal.commit_index(),
            last_applied: self.write_tracker.last_applied(),
            membership: membership.serialize(),
            membership_epoch: membership.epoch,
            shaky_quorum: self.replicator.shaky_quorum(),
            lease_valid: self.lease.is_valid(Instant::now()),
            replicas: self.replicator.status(),
        }
    }

    /// `RAFT_INFO`'s on-wire rendering: the wire/transport layer (out of
    /// scope per spec.md §1) is expected to hand this string back verbatim
    /// as a bulk reply rather than reformat the struct itself.
    pub fn raft_info_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.raft_info())
    }

    pub fn fetch(&self, index: LogIndex) -> Result<LogEntry> {
        self.journal.fetch(index)
    }

    pub fn fetch_last(&self, n: LogIndex) -> Vec<LogEntry> {
        let log_size = self.journal.log_size();
        let log_start = self.journal.log_start();
        let start = log_size.saturating_sub(n).max(log_start);
        (start..log_size).filter_map(|i| self.journal.fetch(i).ok()).collect()
    }

    /// `RAFT_JOURNAL_SCAN`: returns the next cursor and at most `count`
    /// entries from `cursor` onward, skipping any trimmed prefix.
    pub fn journal_scan(&self, cursor: LogIndex, count: LogIndex) -> (LogIndex, Vec<(LogIndex, LogEntry)>) {
        let log_size = self.journal.log_size();
        let start = cursor.max(self.journal.log_start());
        let end = (start + count).min(log_size);
        let entries = (start..end).filter_map(|i| self.journal.fetch(i).ok().map(|e| (i, e))).collect();
        (end, entries)
    }

    pub fn membership(&self) -> Membership {
        self.journal.membership()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::membership::Membership;
    use crate::raft::storage::MemoryStore;
    use crate::state_machine::InMemoryStateMachine;
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    struct UnreachableRpc;

    #[async_trait]
    impl RpcClient for UnreachableRpc {
        async fn request_vote(&self, _peer: &NodeId, request: VoteRequest, _deadline: Duration) -> Result<VoteResponse> {
            Ok(VoteResponse { term: request.term, reply: VoteReply::Granted })
        }
        async fn heartbeat(&self, _peer: &NodeId, request: HeartbeatRequest, _deadline: Duration) -> Result<HeartbeatResponse> {
            Ok(HeartbeatResponse { term: request.term, recognized_as_leader: true, err: None })
        }
        async fn append_entries(&self, _peer: &NodeId, request: AppendEntriesRequest, _deadline: Duration) -> Result<AppendEntriesResponse> {
            Ok(AppendEntriesResponse { term: request.term, log_size: 1, success: true, err: None })
        }
    }

    fn setup() -> Arc<Dispatcher> {
        let members = Membership::new(["a:1"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(), BTreeSet::new(), 0);
        let journal = Arc::new(Journal::open(Arc::new(MemoryStore::new()), "c1", members, FsyncPolicy::Always).unwrap());
        let state = Arc::new(NodeState::new("a:1".to_string(), journal.clone()));
        state.become_candidate(1, &journal.membership()).unwrap();
        state.ascend(1).unwrap();
        let config = RaftConfig::default();
        let heartbeat_tracker = Arc::new(HeartbeatTracker::new(config.clone()));
        let lease = Lease::new(config.lease_duration, 1);
        let commit_tracker = CommitTracker::new(journal.clone(), 1);
        commit_tracker.spawn_auto_committer();
        let rpc: Arc<dyn RpcClient> = Arc::new(UnreachableRpc);
        let replicator = Replicator::new("a:1".to_string(), config.clone(), journal.clone(), state.clone(), rpc.clone(), commit_tracker.clone(), lease.clone());
        let sm: Arc<dyn StateMachine> = Arc::new(InMemoryStateMachine::new());
        let write_tracker = WriteTracker::new(journal.clone(), sm.clone());
        write_tracker.spawn_applier();
        Dispatcher::new(
            "a:1".to_string(),
            "c1".to_string(),
            config,
            journal,
            state,
            heartbeat_tracker,
            lease,
            commit_tracker,
            replicator,
            write_tracker,
            sm,
            rpc,
        )
    }

    #[test]
    fn handshake_requires_matching_cluster_id_and_timeouts() {
        let dispatcher = setup();
        let expected = canonical_handshake_timeouts(&dispatcher.config);
        assert!(dispatcher.handshake(1, "c1", &expected).is_ok());
        assert!(dispatcher.require_authorized(1).is_ok());
        assert!(dispatcher.handshake(2, "wrong", &expected).is_err());
        assert!(dispatcher.require_authorized(2).is_err());
    }

    #[tokio::test]
    async fn write_commits_and_replies_ok() {
        let dispatcher = setup();
        let reply = dispatcher.dispatch_write(1, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]).await.unwrap();
        assert_eq!(reply, Reply::Ok);
    }

    #[tokio::test]
    async fn read_on_single_node_leader_succeeds_once_caught_up() {
        let dispatcher = setup();
        let reply = dispatcher.dispatch_read(&[b"GET".to_vec(), b"k".to_vec()]).await.unwrap();
        assert_eq!(reply, Reply::Nil);
    }

    #[test]
    fn raft_info_json_round_trips_through_serde() {
        let dispatcher = setup();
        let json = dispatcher.raft_info_json().unwrap();
        let parsed: RaftInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.node_id, "a:1");
        assert_eq!(parsed.term, 1);
    }
}

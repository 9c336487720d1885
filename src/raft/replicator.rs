//! Per-follower replication tasks: heartbeat + append-entries, pipelined
//! with backpressure (spec.md §4.6). Grounded on QuarkDB's `RaftReplicator`
//! as referenced by `RaftDirector.cc` (`activate`/`deactivate`) and
//! dennisss-repo's `replicate_entries`
//! (`examples/dennisss-repo/pkg/raft/src/consensus.rs`) for the
//! per-follower progress/pipelining idiom in safe Rust.
//!
//! Each follower gets two logically independent channels, run as separate
//! tasks, so a slow bulk append never stalls the heartbeat that the
//! follower's own election timer and the leader's lease both depend on.

use crate::common::NodeId;
use crate::config::RaftConfig;
use crate::raft::commit_tracker::CommitTracker;
use crate::raft::journal::Journal;
use crate::raft::lease::Lease;
use crate::raft::rpc::{AppendEntriesRequest, HeartbeatRequest, RpcClient};
use crate::raft::state::{NodeState, RaftStateSnapshot};
use crate::raft::types::{LogIndex, Term};
use futures::stream::FuturesOrdered;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

/// `(replica, online, matchIndex)` as exposed to the dispatcher for
/// membership-change admission questions.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub node: NodeId,
    pub online: bool,
    pub match_index: LogIndex,
}

struct FollowerHandle {
    match_index: Arc<AtomicU64>,
    online: Arc<AtomicBool>,
    is_voting: bool,
}

/// Drives one replica task pair per voting follower or observer. Observers
/// receive data but never count toward commit or lease.
pub struct Replicator {
    node_id: NodeId,
    config: RaftConfig,
    journal: Arc<Journal>,
    state: Arc<NodeState>,
    rpc: Arc<dyn RpcClient>,
    commit_tracker: Arc<CommitTracker>,
    lease: Arc<Lease>,
    followers: parking_lot::Mutex<HashMap<NodeId, Arc<FollowerHandle>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    /// Behind-by-more-than-this-many-entries counts as "shaky" for the
    /// membership-change admission check (spec.md §4.6, Status reporting).
    shaky_threshold: LogIndex,
}

impl Replicator {
    pub fn new(
        node_id: NodeId,
        config: RaftConfig,
        journal: Arc<Journal>,
        state: Arc<NodeState>,
        rpc: Arc<dyn RpcClient>,
        commit_tracker: Arc<CommitTracker>,
        lease: Arc<Lease>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            config,
            journal,
            state,
            rpc,
            commit_tracker,
            lease,
            followers: parking_lot::Mutex::new(HashMap::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
            shaky_threshold: 64,
        })
    }

    /// Spawns one heartbeat task and one data task per voting node and
    /// observer other than self, seeded with `nextIndex = logSize` at the
    /// moment of ascension.
    pub fn activate(self: &Arc<Self>, snapshot: Arc<RaftStateSnapshot>) {
        let membership = self.journal.membership();
        let mut followers = self.followers.lock();
        followers.clear();
        let mut tasks = self.tasks.lock();
        tasks.clear();

        let targets: Vec<(NodeId, bool)> = membership
            .nodes
            .iter()
            .filter(|n| **n != self.node_id)
            .map(|n| (n.clone(), true))
            .chain(membership.observers.iter().map(|n| (n.clone(), false)))
            .collect();

        for (peer, is_voting) in targets {
            let handle = Arc::new(FollowerHandle {
                match_index: Arc::new(AtomicU64::new(0)),
                online: Arc::new(AtomicBool::new(false)),
                is_voting,
            });
            followers.insert(peer.clone(), handle.clone());

            tasks.push(tokio::spawn(self.clone().heartbeat_task(peer.clone(), snapshot.clone(), handle.clone())));
            tasks.push(tokio::spawn(self.clone().data_task(peer, snapshot.clone(), handle)));
        }

        let quorum_size = membership.quorum_size();
        let voting_nodes: Vec<NodeId> = membership.nodes.iter().cloned().collect();
        self.commit_tracker.update_targets(quorum_size, &voting_nodes);
        self.lease.update_targets(quorum_size, &voting_nodes);
    }

    /// Aborts and joins every replica task. Idempotent.
    pub async fn deactivate(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        self.followers.lock().clear();
    }

    pub fn status(&self) -> Vec<ReplicaStatus> {
        self.followers
            .lock()
            .iter()
            .map(|(node, handle)| ReplicaStatus {
                node: node.clone(),
                online: handle.online.load(Ordering::Relaxed),
                match_index: handle.match_index.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn match_index_of(&self, node: &str) -> Option<LogIndex> {
        self.followers.lock().get(node).map(|h| h.match_index.load(Ordering::Relaxed))
    }

    /// True if enough voting followers are behind by more than the shaky
    /// threshold that a membership change (losing one more voter) would be
    /// risky. Used by the dispatcher to gate `RAFT_REMOVE_MEMBER`.
    pub fn shaky_quorum(&self) -> bool {
        let log_size = self.journal.log_size();
        let followers = self.followers.lock();
        let behind = followers
            .values()
            .filter(|h| h.is_voting)
            .filter(|h| log_size.saturating_sub(h.match_index.load(Ordering::Relaxed)) > self.shaky_threshold)
            .count();
        behind * 2 >= followers.values().filter(|h| h.is_voting).count().max(1)
    }

    fn is_current(&self, snapshot: &Arc<RaftStateSnapshot>) -> bool {
        Arc::ptr_eq(&self.state.get_snapshot(), snapshot)
    }

    async fn heartbeat_task(self: Arc<Self>, peer: NodeId, snapshot: Arc<RaftStateSnapshot>, handle: Arc<FollowerHandle>) {
        let term = snapshot.term;
        let leader = self.node_id.clone();
        let lease_handler = self.lease.handler(peer.clone());
        loop {
            if !self.is_current(&snapshot) {
                return;
            }
            let broadcast_time = Instant::now();
            let request = HeartbeatRequest { term, leader: leader.clone() };
            let deadline = self.config.heartbeat_interval * 2;
            match self.rpc.heartbeat(&peer, request, deadline).await {
                Ok(response) => {
                    if response.term > term {
                        let _ = self.state.observed(response.term, None);
                        return;
                    }
                    handle.online.store(true, Ordering::Relaxed);
                    if response.recognized_as_leader {
                        lease_handler.heartbeat(broadcast_time);
                    }
                }
                Err(err) => {
                    handle.online.store(false, Ordering::Relaxed);
                    tracing::debug!(%peer, %err, "heartbeat failed, treated as a network error");
                }
            }
            tokio::time::sleep(self.config.heartbeat_interval).await;
        }
    }

    /// One in-flight batch's outcome, kept in submission order by
    /// [`FuturesOrdered`] so acks are applied strictly in log order even
    /// when the underlying RPCs race each other on the wire.
    async fn data_task(self: Arc<Self>, peer: NodeId, snapshot: Arc<RaftStateSnapshot>, handle: Arc<FollowerHandle>) {
        let term = snapshot.term;
        let leader = self.node_id.clone();
        let match_tracker = self.commit_tracker.handle(peer.clone());
        let lease_handler = self.lease.handler(peer.clone());

        let mut next_to_send: LogIndex = self.journal.log_size();
        let mut next_to_apply: LogIndex = next_to_send;
        let mut pipeline: FuturesOrdered<
            std::pin::Pin<Box<dyn std::future::Future<Output = BatchOutcome> + Send>>,
        > = FuturesOrdered::new();

        loop {
            if !self.is_current(&snapshot) {
                return;
            }

            let log_start = self.journal.log_start();
            if next_to_send < log_start {
                // Follower fell behind the trim horizon. Checkpoint shipping
                // is an external collaborator (spec.md §4.6); we can only
                // log and wait for an operator to resilver it.
                tracing::warn!(%peer, next_to_send, log_start, "follower behind trim horizon, needs a checkpoint");
                tokio::time::sleep(self.config.heartbeat_interval).await;
                continue;
            }

            while pipeline.len() < self.config.replication_pipeline_depth && next_to_send < self.journal.log_size() {
                let batch_start = next_to_send;
                let end = (self.journal.log_size()).min(batch_start + self.config.max_batch_entries as LogIndex);
                let mut entries = Vec::new();
                let mut bytes = 0usize;
                for idx in batch_start..end {
                    let Ok(entry) = self.journal.fetch(idx) else { break };
                    bytes += entry.serialize().len();
                    entries.push(entry);
                    if bytes >= self.config.max_batch_bytes {
                        break;
                    }
                }
                if entries.is_empty() {
                    break;
                }
                next_to_send = batch_start + entries.len() as LogIndex;
                pipeline.push_back(Box::pin(self.clone().send_batch(peer.clone(), term, leader.clone(), batch_start, entries)));
            }

            if pipeline.is_empty() {
                // Fully caught up: wait for new entries rather than spin.
                self.journal.wait_for_updates(self.journal.log_size(), self.config.heartbeat_interval).await;
                continue;
            }

            let Some(outcome) = pipeline.next().await else { continue };
            if outcome.start != next_to_apply {
                // Should be unreachable given FuturesOrdered, but guards
                // against ever double-applying a batch out of order.
                continue;
            }
            match outcome.result {
                Ok(response) if response.term > term => {
                    let _ = self.state.observed(response.term, None);
                    return;
                }
                Ok(response) if response.success => {
                    next_to_apply = outcome.start + outcome.len as LogIndex;
                    let matched = next_to_apply.saturating_sub(1);
                    handle.match_index.store(matched, Ordering::Relaxed);
                    handle.online.store(true, Ordering::Relaxed);
                    match_tracker.update(matched);
                    lease_handler.heartbeat(Instant::now());
                }
                Ok(_) => {
                    // Log entry mismatch: back off and retry the whole pipeline.
                    next_to_send = log_start.max(next_to_apply.saturating_sub(1));
                    next_to_apply = next_to_send;
                    pipeline.clear();
                }
                Err(err) => {
                    handle.online.store(false, Ordering::Relaxed);
                    tracing::debug!(%peer, %err, "append-entries failed, treated as a network error");
                    next_to_send = next_to_apply;
                    pipeline.clear();
                }
            }
        }
    }

    async fn send_batch(
        self: Arc<Self>,
        peer: NodeId,
        term: Term,
        leader: NodeId,
        start: LogIndex,
        entries: Vec<crate::raft::types::LogEntry>,
    ) -> BatchOutcome {
        let prev_index = start.saturating_sub(1);
        let prev_term = if prev_index < self.journal.log_start() {
            0
        } else {
            self.journal.fetch(prev_index).map(|e| e.term).unwrap_or(0)
        };
        let len = entries.len();
        let request = AppendEntriesRequest {
            leader,
            term,
            prev_index,
            prev_term,
            commit_index: self.journal.commit_index(),
            entries,
        };
        let deadline = self.config.heartbeat_interval * 2;
        let result = self.rpc.append_entries(&peer, request, deadline).await;
        BatchOutcome { start, len, result }
    }
}

struct BatchOutcome {
    start: LogIndex,
    len: usize,
    result: crate::error::Result<crate::raft::rpc::AppendEntriesResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsyncPolicy;
    use crate::raft::election::{VoteRequest, VoteResponse};
    use crate::raft::membership::Membership;
    use crate::raft::rpc::{AppendEntriesResponse, HeartbeatResponse};
    use crate::raft::storage::MemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct AlwaysOkRpc {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcClient for AlwaysOkRpc {
        async fn request_vote(&self, _peer: &NodeId, request: VoteRequest, _deadline: Duration) -> crate::error::Result<VoteResponse> {
            Ok(VoteResponse { term: request.term, reply: crate::raft::election::VoteReply::Granted })
        }

        async fn heartbeat(&self, _peer: &NodeId, request: HeartbeatRequest, _deadline: Duration) -> crate::error::Result<HeartbeatResponse> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(HeartbeatResponse { term: request.term, recognized_as_leader: true, err: None })
        }

        async fn append_entries(&self, _peer: &NodeId, request: AppendEntriesRequest, _deadline: Duration) -> crate::error::Result<AppendEntriesResponse> {
            let log_size = request.prev_index + request.entries.len() as LogIndex + 1;
            Ok(AppendEntriesResponse { term: request.term, log_size, success: true, err: None })
        }
    }

    fn members(nodes: &[&str]) -> Membership {
        Membership::new(nodes.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(), BTreeSet::new(), 0)
    }

    #[tokio::test]
    async fn activate_replicates_to_quorum_and_advances_commit() {
        let journal = Arc::new(
            Journal::open(Arc::new(MemoryStore::new()), "c1", members(&["a:1", "b:2", "c:3"]), FsyncPolicy::Always).unwrap(),
        );
        journal
            .append(1, crate::raft::types::LogEntry::new(0, crate::raft::types::Command::Data(vec![b"X".to_vec()])))
            .unwrap();
        let state = Arc::new(NodeState::new("a:1".to_string(), journal.clone()));
        state.become_candidate(1, &members(&["a:1", "b:2", "c:3"])).unwrap();
        state.ascend(1).unwrap();
        let snapshot = state.get_snapshot();

        let rpc: Arc<dyn RpcClient> = Arc::new(AlwaysOkRpc { calls: AtomicUsize::new(0) });
        let commit_tracker = CommitTracker::new(journal.clone(), 2);
        let lease = Lease::new(Duration::from_secs(2), 2);
        let replicator = Replicator::new(
            "a:1".to_string(),
            RaftConfig::default(),
            journal.clone(),
            state.clone(),
            rpc,
            commit_tracker,
            lease,
        );
        replicator.activate(snapshot);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(journal.commit_index() >= 1);
        replicator.deactivate().await;
    }
}

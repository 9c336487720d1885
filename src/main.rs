//! Bootstraps a single raft node process. Wire transport, client framing,
//! and the state-machine data model are external collaborators (spec.md
//! §1); this binary wires the consensus core together and exposes nothing
//! beyond what a real transport layer would need to drive it.

use async_trait::async_trait;
use raftdb::common::NodeId;
use raftdb::raft::commit_tracker::CommitTracker;
use raftdb::raft::dispatcher::Dispatcher;
use raftdb::raft::director::Director;
use raftdb::raft::election::{VoteRequest, VoteResponse};
use raftdb::raft::heartbeat::HeartbeatTracker;
use raftdb::raft::journal::Journal;
use raftdb::raft::lease::Lease;
use raftdb::raft::membership::Membership;
use raftdb::raft::replicator::Replicator;
use raftdb::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, HeartbeatRequest, HeartbeatResponse, RpcClient};
use raftdb::raft::state::NodeState;
use raftdb::raft::storage::MemoryStore;
use raftdb::raft::write_tracker::WriteTracker;
use raftdb::state_machine::InMemoryStateMachine;
use raftdb::{Config, DbError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Placeholder outbound transport: every peer call fails immediately. A
/// real deployment wires in a client that speaks the wire protocol from
/// spec.md §6; until then a single-node cluster is the only configuration
/// this binary can usefully run, since it never needs to call a peer.
struct UnimplementedRpcClient;

#[async_trait]
impl RpcClient for UnimplementedRpcClient {
    async fn request_vote(&self, peer: &NodeId, _request: VoteRequest, _deadline: Duration) -> Result<VoteResponse> {
        Err(DbError::Unavailable(format!("no transport wired to {peer}")))
    }

    async fn heartbeat(&self, peer: &NodeId, _request: HeartbeatRequest, _deadline: Duration) -> Result<HeartbeatResponse> {
        Err(DbError::Unavailable(format!("no transport wired to {peer}")))
    }

    async fn append_entries(&self, peer: &NodeId, _request: AppendEntriesRequest, _deadline: Duration) -> Result<AppendEntriesResponse> {
        Err(DbError::Unavailable(format!("no transport wired to {peer}")))
    }
}

fn load_config() -> Config {
    let mut config = Config::default();
    if let Ok(node_id) = std::env::var("RAFTDB_NODE_ID") {
        config.node_id = node_id;
    }
    if let Ok(data_dir) = std::env::var("RAFTDB_DATA_DIR") {
        config.data_dir = data_dir;
    }
    if let Ok(port) = std::env::var("RAFTDB_PORT") {
        if let Ok(port) = port.parse() {
            config.port = port;
        }
    }
    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config();
    tracing::info!(node_id = %config.node_id, data_dir = %config.data_dir, "starting raftdb node");

    let cluster_id = std::env::var("RAFTDB_CLUSTER_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
    let initial_members = Membership::new(
        std::iter::once(config.node_id.clone()).collect::<BTreeSet<_>>(),
        BTreeSet::new(),
        0,
    );

    let store = Arc::new(MemoryStore::new());
    let journal = Arc::new(
        Journal::open(store, &cluster_id, initial_members, config.raft.fsync_policy)
            .expect("failed to open journal"),
    );
    let state = Arc::new(NodeState::new(config.node_id.clone(), journal.clone()));
    let heartbeat_tracker = Arc::new(HeartbeatTracker::new(config.raft.clone()));
    let lease = Lease::new(config.raft.lease_duration, journal.membership().quorum_size());
    let commit_tracker = CommitTracker::new(journal.clone(), journal.membership().quorum_size());
    commit_tracker.spawn_auto_committer();

    let rpc: Arc<dyn RpcClient> = Arc::new(UnimplementedRpcClient);
    let replicator = Replicator::new(
        config.node_id.clone(),
        config.raft.clone(),
        journal.clone(),
        state.clone(),
        rpc.clone(),
        commit_tracker.clone(),
        lease.clone(),
    );

    let state_machine = Arc::new(InMemoryStateMachine::new());
    let write_tracker = WriteTracker::new(journal.clone(), state_machine.clone());
    write_tracker.spawn_applier();

    let dispatcher = Dispatcher::new(
        config.node_id.clone(),
        cluster_id,
        config.raft.clone(),
        journal.clone(),
        state.clone(),
        heartbeat_tracker.clone(),
        lease.clone(),
        commit_tracker,
        replicator.clone(),
        write_tracker.clone(),
        state_machine,
        rpc.clone(),
    );
    // Kept alive for the process lifetime; a transport layer would hold
    // this handle to route incoming connections' requests.
    let _dispatcher = dispatcher;

    let shutdown_state = state.clone();
    let director = Director::new(
        config.node_id.clone(),
        config.raft.clone(),
        journal,
        state,
        heartbeat_tracker,
        lease,
        replicator,
        write_tracker,
        rpc,
    );
    let director_task = tokio::spawn(director.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            shutdown_state.shutdown();
        }
        result = director_task => {
            if let Err(err) = result {
                tracing::error!(%err, "director task exited unexpectedly");
            }
        }
    }
}

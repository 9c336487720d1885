//! The transport boundary. Wire framing/codec and the TCP/TLS link are
//! external collaborators (spec.md §1); this trait is the seam the core's
//! election and replication logic is written against. Grounded on
//! QuarkDB's `qclient`-based `future + deadline` request pattern used
//! throughout `RaftVoteRegistry::registerVote` and `RaftReplicator`.

use crate::common::NodeId;
use crate::error::Result;
use crate::raft::election::{VoteRequest, VoteResponse};
use crate::raft::types::{LogEntry, LogIndex, Term};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub term: Term,
    pub leader: NodeId,
}

#[derive(Debug, Clone)]
pub struct HeartbeatResponse {
    pub term: Term,
    pub recognized_as_leader: bool,
    pub err: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesRequest {
    pub leader: NodeId,
    pub term: Term,
    pub prev_index: LogIndex,
    pub prev_term: Term,
    pub commit_index: LogIndex,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub log_size: LogIndex,
    pub success: bool,
    pub err: Option<String>,
}

/// Outbound raft RPCs to a single peer. An implementation owns the
/// handshake, the wire codec, and the TCP/TLS link; none of that is this
/// crate's concern.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn request_vote(&self, peer: &NodeId, request: VoteRequest, deadline: Duration) -> Result<VoteResponse>;
    async fn heartbeat(&self, peer: &NodeId, request: HeartbeatRequest, deadline: Duration) -> Result<HeartbeatResponse>;
    async fn append_entries(&self, peer: &NodeId, request: AppendEntriesRequest, deadline: Duration) -> Result<AppendEntriesResponse>;
}

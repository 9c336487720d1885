//! Pre-vote + real-vote tallying and veto semantics (spec.md §4.9).
//! Grounded directly on QuarkDB `RaftVoteRegistry.hh`/`.cc`
//! (`determineOutcome`, `describeOutcome`, `observeTermsAndLeases`) and the
//! teacher's `ElectionManager::handle_vote_request` for the log
//! up-to-date check idiom (`networking/membership/raft/election.rs`).

use crate::common::NodeId;
use crate::error::Result;
use crate::raft::journal::Journal;
use crate::raft::lease::Lease;
use crate::raft::membership::Membership;
use crate::raft::rpc::RpcClient;
use crate::raft::state::NodeState;
use crate::raft::types::{LogIndex, Term};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub pre_vote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteReply {
    Granted,
    Refused,
    Veto,
}

#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub term: Term,
    pub reply: VoteReply,
}

enum SingleVote {
    Response(VoteResponse),
    NetworkError,
    ParseError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Elected,
    NotElected,
    Vetoed,
}

/// Collects per-voter outcomes for one election round.
pub struct VoteRegistry {
    quorum_size: usize,
    pre_vote: bool,
    votes: HashMap<NodeId, SingleVote>,
}

impl VoteRegistry {
    pub fn new(quorum_size: usize, pre_vote: bool) -> Self {
        Self { quorum_size, pre_vote, votes: HashMap::new() }
    }

    pub fn register_vote(&mut self, voter: NodeId, response: VoteResponse) {
        self.votes.insert(voter, SingleVote::Response(response));
    }

    pub fn register_parse_error(&mut self, voter: NodeId) {
        self.votes.insert(voter, SingleVote::ParseError);
    }

    pub fn register_network_error(&mut self, voter: NodeId) {
        self.votes.insert(voter, SingleVote::NetworkError);
    }

    pub fn count(&self, reply: VoteReply) -> usize {
        self.votes
            .values()
            .filter(|v| matches!(v, SingleVote::Response(r) if r.reply == reply))
            .count()
    }

    pub fn count_network_error(&self) -> usize {
        self.votes.values().filter(|v| matches!(v, SingleVote::NetworkError)).count()
    }

    pub fn count_parse_error(&self) -> usize {
        self.votes.values().filter(|v| matches!(v, SingleVote::ParseError)).count()
    }

    /// A veto from any voter fails the election regardless of a positive
    /// quorum elsewhere. A pre-vote reply that fails to parse counts as
    /// granted (tolerates older peers mid-rolling-upgrade); the same
    /// failure in a real vote round is a network error (neutral).
    pub fn determine_outcome(&self) -> VoteOutcome {
        if self.votes.values().any(|v| matches!(v, SingleVote::Response(r) if r.reply == VoteReply::Veto)) {
            return VoteOutcome::Vetoed;
        }
        let mut granted = 1; // implicit self-vote
        granted += self.count(VoteReply::Granted);
        if self.pre_vote {
            granted += self.count_parse_error();
        }
        if granted >= self.quorum_size {
            VoteOutcome::Elected
        } else {
            VoteOutcome::NotElected
        }
    }

    /// Human-readable tally, logged once the round concludes. Logs a
    /// critical-level line for the "quorum of positive votes plus a veto"
    /// case, since that combination means a correct cluster still refused
    /// a candidate that looked electable.
    pub fn describe_outcome(&self) -> String {
        let granted = 1 + self.count(VoteReply::Granted);
        let refused = self.count(VoteReply::Refused);
        let veto = self.count(VoteReply::Veto);
        let net_err = self.count_network_error();
        let parse_err = self.count_parse_error();
        let summary = format!(
            "granted={granted} refused={refused} veto={veto} network_errors={net_err} parse_errors={parse_err} quorum={}",
            self.quorum_size
        );
        if veto > 0 && granted >= self.quorum_size {
            tracing::error!(%summary, "quorum of positive votes alongside a veto");
        }
        summary
    }

    /// After a *real* (non-pre-vote) round, every responder's term is
    /// observed (possible step-down), and every granting node's lease
    /// handle is heartbeated with the broadcast timestamp. Pre-vote rounds
    /// never mutate state from a non-binding probe.
    pub fn observe_terms_and_leases(&self, state: &NodeState, lease: &Arc<Lease>, broadcast_time: Instant) -> Result<()> {
        if self.pre_vote {
            return Ok(());
        }
        for (voter, vote) in &self.votes {
            if let SingleVote::Response(response) = vote {
                state.observed(response.term, None)?;
                if response.reply == VoteReply::Granted {
                    lease.handler(voter.clone()).heartbeat(broadcast_time);
                }
            }
        }
        Ok(())
    }
}

/// The Raft paper's log up-to-date test: `req.lastTerm > myLastTerm` or
/// (`req.lastTerm == myLastTerm` and `req.lastIndex >= myLastIndex`).
pub fn log_is_up_to_date(candidate_last_term: Term, candidate_last_index: LogIndex, my_last_term: Term, my_last_index: LogIndex) -> bool {
    candidate_last_term > my_last_term || (candidate_last_term == my_last_term && candidate_last_index >= my_last_index)
}

/// Evaluates an incoming vote request against local state, mirroring
/// QuarkDB's voter-side checks (committed-history protection is the veto
/// case beyond stock Raft).
pub fn evaluate_vote_request(
    request: &VoteRequest,
    state: &NodeState,
    journal: &Journal,
    membership: &Membership,
) -> VoteResponse {
    let snapshot = state.get_snapshot();

    if request.term < snapshot.term {
        return VoteResponse { term: snapshot.term, reply: VoteReply::Refused };
    }
    if !membership.is_voting_member(&request.candidate_id) {
        return VoteResponse { term: snapshot.term, reply: VoteReply::Refused };
    }
    if !request.pre_vote {
        if let Some(voted_for) = &snapshot.voted_for {
            if voted_for != &request.candidate_id {
                return VoteResponse { term: snapshot.term, reply: VoteReply::Refused };
            }
        }
        if snapshot.leader.is_some() && snapshot.leader.as_deref() != Some(request.candidate_id.as_str()) {
            return VoteResponse { term: snapshot.term, reply: VoteReply::Refused };
        }
    }

    let my_last_index = journal.log_size().saturating_sub(1);
    let my_last_term = journal.fetch(my_last_index).map(|e| e.term).unwrap_or(0);

    if !log_is_up_to_date(request.last_log_term, request.last_log_index, my_last_term, my_last_index) {
        let commit_index = journal.commit_index();
        if request.last_log_index < commit_index {
            return VoteResponse { term: snapshot.term, reply: VoteReply::Veto };
        }
        return VoteResponse { term: snapshot.term, reply: VoteReply::Refused };
    }

    VoteResponse { term: request.term.max(snapshot.term), reply: VoteReply::Granted }
}

/// Broadcasts a single round — pre-vote or real — to every other voting
/// member and tallies the result. Candidate-side counterpart to
/// [`evaluate_vote_request`]; grounded on QuarkDB's `RaftVoteRequest` fan-out
/// in `RaftDirector::runForLeader`.
pub async fn run_election(
    node_id: &NodeId,
    membership: &Membership,
    journal: &Journal,
    rpc: &Arc<dyn RpcClient>,
    term: Term,
    pre_vote: bool,
    deadline: Duration,
) -> (VoteOutcome, VoteRegistry) {
    let quorum_size = membership.quorum_size();
    let mut registry = VoteRegistry::new(quorum_size, pre_vote);

    let last_index = journal.log_size().saturating_sub(1);
    let last_term = journal.fetch(last_index).map(|e| e.term).unwrap_or(0);
    let request = VoteRequest {
        term,
        candidate_id: node_id.clone(),
        last_log_index: last_index,
        last_log_term: last_term,
        pre_vote,
    };

    let peers: Vec<NodeId> = membership.nodes.iter().filter(|n| *n != node_id).cloned().collect();
    let futures = peers.into_iter().map(|peer| {
        let rpc = rpc.clone();
        let request = request.clone();
        async move {
            let outcome = rpc.request_vote(&peer, request, deadline).await;
            (peer, outcome)
        }
    });
    let results = futures::future::join_all(futures).await;

    for (peer, outcome) in results {
        match outcome {
            Ok(response) => registry.register_vote(peer, response),
            Err(err) => {
                tracing::debug!(%peer, %err, "vote request failed");
                if matches!(err, crate::error::DbError::Serialization(_)) {
                    registry.register_parse_error(peer);
                } else {
                    registry.register_network_error(peer);
                }
            }
        }
    }

    let outcome = registry.determine_outcome();
    tracing::info!(term, pre_vote, outcome = ?outcome, tally = %registry.describe_outcome(), "election round concluded");
    (outcome, registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(term: Term) -> VoteResponse {
        VoteResponse { term, reply: VoteReply::Granted }
    }
    fn refused(term: Term) -> VoteResponse {
        VoteResponse { term, reply: VoteReply::Refused }
    }
    fn veto(term: Term) -> VoteResponse {
        VoteResponse { term, reply: VoteReply::Veto }
    }

    #[test]
    fn quorum_of_grants_elects() {
        let mut registry = VoteRegistry::new(2, false);
        registry.register_vote("b:2".into(), granted(1));
        assert_eq!(registry.determine_outcome(), VoteOutcome::Elected);
    }

    #[test]
    fn single_veto_overrides_quorum_of_grants() {
        let mut registry = VoteRegistry::new(2, false);
        registry.register_vote("b:2".into(), granted(1));
        registry.register_vote("c:3".into(), veto(1));
        assert_eq!(registry.determine_outcome(), VoteOutcome::Vetoed);
    }

    #[test]
    fn refusals_without_quorum_do_not_elect() {
        let mut registry = VoteRegistry::new(3, false);
        registry.register_vote("b:2".into(), refused(1));
        registry.register_vote("c:3".into(), refused(1));
        assert_eq!(registry.determine_outcome(), VoteOutcome::NotElected);
    }

    #[test]
    fn parse_error_counts_as_granted_only_in_pre_vote() {
        let mut pre = VoteRegistry::new(2, true);
        pre.register_parse_error("b:2".into());
        assert_eq!(pre.determine_outcome(), VoteOutcome::Elected);

        let mut real = VoteRegistry::new(2, false);
        real.register_parse_error("b:2".into());
        assert_eq!(real.determine_outcome(), VoteOutcome::NotElected);
    }

    #[test]
    fn log_up_to_date_matches_raft_paper_rule() {
        assert!(log_is_up_to_date(5, 10, 4, 100));
        assert!(log_is_up_to_date(5, 10, 5, 10));
        assert!(log_is_up_to_date(5, 10, 5, 11) == false);
        assert!(!log_is_up_to_date(4, 100, 5, 1));
    }
}

//! The state-machine data model (strings/hashes/sets) is an external
//! collaborator (spec.md §1); this module only defines the trait boundary
//! the write tracker and dispatcher are built against, plus a minimal
//! in-memory implementation for tests. Grounded on QuarkDB's
//! `StateMachine::getLastApplied()` surface, referenced throughout
//! `RaftWriteTracker.cc`.

use crate::error::Result;
use crate::raft::types::LogIndex;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Reply produced by applying one command, routed back to the client by
/// the write tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Bulk(Vec<u8>),
    Error(String),
    Nil,
}

/// The replicated data store every committed entry is ultimately applied
/// to. Out of scope per spec.md §1 beyond this seam: the concrete key
/// encoding, the command set, and pub/sub all live on the other side of
/// this trait.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Applies one command at `index`, returning the reply for whichever
    /// connection is waiting on it (or an anonymous apply if none is).
    async fn apply(&self, index: LogIndex, command: &[Vec<u8>]) -> Result<Reply>;

    /// Applies a no-op for a control entry (`UPDATE_MEMBERS`,
    /// `LEADERSHIP_MARKER`) — it still counts toward `lastApplied`.
    async fn apply_control(&self, index: LogIndex);

    /// Answers a read directly, without going through the log. Callers
    /// (the dispatcher) are responsible for only reaching this once the
    /// leadership/staleness preconditions in spec.md §4.8 are satisfied.
    async fn read(&self, command: &[Vec<u8>]) -> Result<Reply>;

    fn last_applied(&self) -> LogIndex;

    /// A monotonically-advancing clock synchronized to leadership markers,
    /// used by the dispatcher's lease filter so every follower applies
    /// identical wall-time semantics for time-dependent commands (spec.md
    /// §4.8).
    fn dynamic_clock(&self) -> u64;

    fn advance_dynamic_clock(&self, new_value: u64);
}

/// A minimal in-memory state machine: stores the last command's tokens per
/// index and nothing else. Adequate for exercising the write tracker and
/// dispatcher without depending on a real key-value engine.
pub struct InMemoryStateMachine {
    last_applied: AtomicU64,
    dynamic_clock: AtomicU64,
    applied: Mutex<Vec<(LogIndex, Vec<Vec<u8>>)>>,
}

impl Default for InMemoryStateMachine {
    fn default() -> Self {
        Self {
            last_applied: AtomicU64::new(0),
            dynamic_clock: AtomicU64::new(0),
            applied: Mutex::new(Vec::new()),
        }
    }
}

impl InMemoryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied_log(&self) -> Vec<(LogIndex, Vec<Vec<u8>>)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateMachine for InMemoryStateMachine {
    async fn apply(&self, index: LogIndex, command: &[Vec<u8>]) -> Result<Reply> {
        self.applied.lock().unwrap().push((index, command.to_vec()));
        self.last_applied.store(index, Ordering::SeqCst);
        Ok(Reply::Ok)
    }

    async fn apply_control(&self, index: LogIndex) {
        self.last_applied.store(index, Ordering::SeqCst);
    }

    async fn read(&self, _command: &[Vec<u8>]) -> Result<Reply> {
        Ok(Reply::Nil)
    }

    fn last_applied(&self) -> LogIndex {
        self.last_applied.load(Ordering::SeqCst)
    }

    fn dynamic_clock(&self) -> u64 {
        self.dynamic_clock.load(Ordering::SeqCst)
    }

    fn advance_dynamic_clock(&self, new_value: u64) {
        self.dynamic_clock.fetch_max(new_value, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn apply_advances_last_applied() {
        let sm = InMemoryStateMachine::new();
        sm.apply(1, &[b"SET".to_vec()]).await.unwrap();
        assert_eq!(sm.last_applied(), 1);
    }

    #[tokio::test]
    async fn apply_control_counts_toward_last_applied_without_touching_log() {
        let sm = InMemoryStateMachine::new();
        sm.apply_control(3).await;
        assert_eq!(sm.last_applied(), 3);
        assert!(sm.applied_log().is_empty());
    }

    #[test]
    fn dynamic_clock_never_regresses() {
        let sm = InMemoryStateMachine::new();
        sm.advance_dynamic_clock(10);
        sm.advance_dynamic_clock(5);
        assert_eq!(sm.dynamic_clock(), 10);
    }
}

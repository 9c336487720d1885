//! Bridges the durable log to the state machine: applies committed entries
//! in order and wakes whichever client connection is waiting on each one
//! (spec.md §4.7). Grounded directly on QuarkDB's `RaftWriteTracker.hh`/`.cc`
//! and `RaftBlockedWrites.hh`/`.cc`.

use crate::error::{DbError, Result};
use crate::raft::journal::Journal;
use crate::raft::types::{Command, LogIndex};
use crate::state_machine::{Reply, StateMachine};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A write appended by this node's dispatcher, waiting for its own commit
/// and application before the client gets a reply.
struct PendingWrite {
    index: LogIndex,
    reply_tx: oneshot::Sender<Result<Reply>>,
}

/// One node's queue of writes it personally appended, kept in index order
/// so `flush` can match a contiguous prefix of applied indices to waiters
/// without a full index lookup.
#[derive(Default)]
struct PendingQueue {
    queue: std::collections::VecDeque<PendingWrite>,
}

impl PendingQueue {
    fn push(&mut self, index: LogIndex, reply_tx: oneshot::Sender<Result<Reply>>) {
        self.queue.push_back(PendingWrite { index, reply_tx });
    }

    fn take_ready(&mut self, applied_through: LogIndex) -> Vec<PendingWrite> {
        let mut ready = Vec::new();
        while let Some(front) = self.queue.front() {
            if front.index > applied_through {
                break;
            }
            ready.push(self.queue.pop_front().unwrap());
        }
        ready
    }

    fn drain_all(&mut self) -> Vec<PendingWrite> {
        self.queue.drain(..).collect()
    }
}

/// Blocks a write until the membership entry it depends on commits, or
/// until a leadership change makes the wait moot (spec.md §4.7, "blocked
/// writes"). Distinct from [`PendingQueue`]: a blocked write has not been
/// appended to the log yet at all.
pub struct BlockedWrites {
    waiters: Mutex<Vec<oneshot::Sender<()>>>,
}

impl Default for BlockedWrites {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockedWrites {
    pub fn new() -> Self {
        Self { waiters: Mutex::new(Vec::new()) }
    }

    pub fn register(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push(tx);
        rx
    }

    /// Wakes every blocked write once the membership epoch they were
    /// waiting on has committed.
    pub fn release_all(&self) {
        for tx in self.waiters.lock().drain(..) {
            let _ = tx.send(());
        }
    }
}

/// Owns the applier task: the single sequential consumer of committed log
/// entries. Only one instance may run per node, since applying out of
/// order would violate the replicated state machine's determinism.
pub struct WriteTracker {
    journal: Arc<Journal>,
    state_machine: Arc<dyn StateMachine>,
    pending: Mutex<HashMap<LogIndex, PendingQueue>>,
    blocked: Arc<BlockedWrites>,
}

impl WriteTracker {
    pub fn new(journal: Arc<Journal>, state_machine: Arc<dyn StateMachine>) -> Arc<Self> {
        Arc::new(Self {
            journal,
            state_machine,
            pending: Mutex::new(HashMap::new()),
            blocked: Arc::new(BlockedWrites::new()),
        })
    }

    pub fn blocked_writes(&self) -> Arc<BlockedWrites> {
        self.blocked.clone()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state_machine.last_applied()
    }

    /// Registers interest in the reply for the entry this node just
    /// appended at `index`, keyed by the connection's identity.
    pub fn track(&self, connection: u64, index: LogIndex) -> oneshot::Receiver<Result<Reply>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().entry(connection).or_default().push(index, tx);
        rx
    }

    /// Spawns the task that drains committed-but-unapplied entries in
    /// strict index order, applying each to the state machine and routing
    /// its reply to whichever connection (if any) is waiting on it.
    pub fn spawn_applier(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = self.clone();
        let mut next = tracker.journal.log_start();
        tokio::spawn(async move {
            loop {
                let commit_index = tracker.journal.commit_index();
                while next <= commit_index {
                    tracker.apply_one(next).await;
                    next += 1;
                }
                tracker.journal.wait_for_commits(commit_index).await;
            }
        })
    }

    async fn apply_one(&self, index: LogIndex) {
        let entry = match self.journal.fetch(index) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(index, %err, "committed entry missing from journal");
                return;
            }
        };

        let reply: Result<Reply> = match &entry.command {
            Command::Data(tokens) => self.state_machine.apply(index, tokens).await,
            Command::UpdateMembers { .. } => {
                self.state_machine.apply_control(index).await;
                self.blocked.release_all();
                Ok(Reply::Ok)
            }
            Command::LeadershipMarker { term, .. } => {
                self.state_machine.apply_control(index).await;
                self.state_machine.advance_dynamic_clock(*term);
                Ok(Reply::Ok)
            }
        };

        self.dispatch_reply(index, reply);
    }

    fn dispatch_reply(&self, index: LogIndex, reply: Result<Reply>) {
        let mut pending = self.pending.lock();
        for queue in pending.values_mut() {
            for waiter in queue.take_ready(index) {
                if waiter.index == index {
                    let _ = waiter.reply_tx.send(reply.clone());
                } else {
                    let _ = waiter.reply_tx.send(Err(DbError::Unavailable(
                        "entry was superseded before it could be applied".to_string(),
                    )));
                }
            }
        }
        pending.retain(|_, queue| !queue.queue.is_empty());
    }

    /// Fails every still-pending write for a connection, e.g. because the
    /// connection dropped or this node stepped down before the write
    /// committed (spec.md §4.7, "abandoned writes").
    pub fn flush_connection(&self, connection: u64, err: DbError) {
        if let Some(mut queue) = self.pending.lock().remove(&connection) {
            for waiter in queue.drain_all() {
                let _ = waiter.reply_tx.send(Err(err.clone()));
            }
        }
    }

    /// Fails every pending write across every connection. Called when this
    /// node loses leadership: none of its in-flight writes can be trusted
    /// to commit under the old term.
    pub fn flush_all(&self, err: DbError) {
        let mut pending = self.pending.lock();
        for (_, mut queue) in pending.drain() {
            for waiter in queue.drain_all() {
                let _ = waiter.reply_tx.send(Err(err.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsyncPolicy;
    use crate::raft::membership::Membership;
    use crate::raft::storage::MemoryStore;
    use crate::raft::types::LogEntry;
    use crate::state_machine::InMemoryStateMachine;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn journal() -> Arc<Journal> {
        let members = Membership::new(["a:1"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(), BTreeSet::new(), 0);
        Arc::new(Journal::open(Arc::new(MemoryStore::new()), "c1", members, FsyncPolicy::Always).unwrap())
    }

    #[tokio::test]
    async fn applier_drains_committed_entries_and_replies_to_waiter() {
        let journal = journal();
        journal.append(1, LogEntry::new(0, Command::Data(vec![b"SET".to_vec()]))).unwrap();
        let sm: Arc<dyn StateMachine> = Arc::new(InMemoryStateMachine::new());
        let tracker = WriteTracker::new(journal.clone(), sm);
        let rx = tracker.track(1, 1);
        tracker.spawn_applier();
        journal.set_commit_index(1).unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(reply.unwrap(), Reply::Ok);
        assert_eq!(tracker.last_applied(), 1);
    }

    #[tokio::test]
    async fn flush_all_fails_pending_writes_immediately() {
        let journal = journal();
        let sm: Arc<dyn StateMachine> = Arc::new(InMemoryStateMachine::new());
        let tracker = WriteTracker::new(journal.clone(), sm);
        let rx = tracker.track(1, 5);
        tracker.flush_all(DbError::Unavailable("stepped down".into()));
        let reply = rx.await.unwrap();
        assert!(reply.is_err());
    }

    #[tokio::test]
    async fn blocked_writes_release_on_membership_commit() {
        let tracker = BlockedWrites::new();
        let rx = tracker.register();
        tracker.release_all();
        assert!(tokio::time::timeout(Duration::from_millis(100), rx).await.unwrap().is_ok());
    }
}

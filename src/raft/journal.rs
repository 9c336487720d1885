//! The replicated log: durable, ordered, with term/vote/membership/commit
//! metadata and condition-variable wake-ups for waiters (spec.md §4.1).
//!
//! Grounded directly on QuarkDB's `RaftJournal.hh`/`.cc` (the operation
//! contracts below follow its API one-to-one) and on `RaftLog`
//! (`networking/membership/raft/log.rs`) for the Rust-idiomatic
//! `RwLock`-guarded-state shape. Condition variables `commitNotifier` and
//! `logUpdated` become `tokio::sync::Notify`.

use crate::common::NodeId;
use crate::config::FsyncPolicy;
use crate::error::{fatal, DbError, Result};
use crate::raft::membership::Membership;
use crate::raft::storage::{
    entry_key, JournalStore, KEY_CLUSTER_ID, KEY_COMMIT_INDEX, KEY_CURRENT_TERM, KEY_LOG_SIZE,
    KEY_LOG_START, KEY_MEMBERS, KEY_MEMBERSHIP_EPOCH, KEY_PREVIOUS_MEMBERS,
    KEY_PREVIOUS_MEMBERSHIP_EPOCH, KEY_VOTED_FOR,
};
use crate::raft::types::{Command, LogEntry, LogIndex, Term, BLOCKED_VOTE};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout as tokio_timeout;

struct Content {
    log_start: LogIndex,
    log_size: LogIndex,
}

struct MembersState {
    current: Membership,
    previous: Option<Membership>,
    previous_epoch: Option<LogIndex>,
}

/// The durable, ordered log plus the raft metadata that rides alongside it.
pub struct Journal {
    store: Arc<dyn JournalStore>,
    cluster_id: String,
    fsync_policy: RwLock<FsyncPolicy>,
    term_vote: RwLock<(Term, Option<NodeId>)>,
    content: Mutex<Content>,
    commit_index: RwLock<LogIndex>,
    members: RwLock<MembersState>,
    log_updated: Notify,
    commit_updated: Notify,
}

fn u64_le(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(arr)
}

impl Journal {
    /// Opens an existing journal, or bootstraps a fresh one: writes an
    /// initial entry at index 0 with `UPDATE_MEMBERS(initial_members,
    /// cluster_id)` at term 0, and sets `commitIndex=0`, `logSize=1`
    /// (spec.md §6, "Cluster bootstrap").
    pub fn open(
        store: Arc<dyn JournalStore>,
        cluster_id: &str,
        initial_members: Membership,
        fsync_policy: FsyncPolicy,
    ) -> Result<Self> {
        if let Some(raw) = store.get(KEY_LOG_SIZE) {
            let log_size = u64_le(&raw);
            let log_start = store.get(KEY_LOG_START).map(|b| u64_le(&b)).unwrap_or(0);
            let commit_index = store.get(KEY_COMMIT_INDEX).map(|b| u64_le(&b)).unwrap_or(0);
            let term = store.get(KEY_CURRENT_TERM).map(|b| u64_le(&b)).unwrap_or(0);
            let vote = store
                .get(KEY_VOTED_FOR)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .filter(|s| !s.is_empty());
            let epoch = store.get(KEY_MEMBERSHIP_EPOCH).map(|b| u64_le(&b)).unwrap_or(0);
            let members_str = store
                .get(KEY_MEMBERS)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();
            let current = Membership::deserialize(&members_str, epoch);
            let previous_epoch = store.get(KEY_PREVIOUS_MEMBERSHIP_EPOCH).map(|b| u64_le(&b));
            let previous = store.get(KEY_PREVIOUS_MEMBERS).map(|b| {
                Membership::deserialize(
                    &String::from_utf8_lossy(&b),
                    previous_epoch.unwrap_or(0),
                )
            });
            let stored_cluster_id = store
                .get(KEY_CLUSTER_ID)
                .map(|b| String::from_utf8_lossy(&b).into_owned());
            if let Some(existing) = &stored_cluster_id {
                if existing != cluster_id {
                    return Err(DbError::InvalidArgument(format!(
                        "cluster id mismatch: store has {existing}, asked to open {cluster_id}"
                    )));
                }
            }
            return Ok(Journal {
                store,
                cluster_id: cluster_id.to_string(),
                fsync_policy: RwLock::new(fsync_policy),
                term_vote: RwLock::new((term, vote)),
                content: Mutex::new(Content { log_start, log_size }),
                commit_index: RwLock::new(commit_index),
                members: RwLock::new(MembersState { current, previous, previous_epoch }),
                log_updated: Notify::new(),
                commit_updated: Notify::new(),
            });
        }

        let journal = Journal {
            store,
            cluster_id: cluster_id.to_string(),
            fsync_policy: RwLock::new(fsync_policy),
            term_vote: RwLock::new((0, None)),
            content: Mutex::new(Content { log_start: 0, log_size: 0 }),
            commit_index: RwLock::new(0),
            members: RwLock::new(MembersState {
                current: Membership::default(),
                previous: None,
                previous_epoch: None,
            }),
            log_updated: Notify::new(),
            commit_updated: Notify::new(),
        };
        journal.store.put(KEY_CLUSTER_ID, cluster_id.as_bytes())?;
        let entry = LogEntry::new(
            0,
            Command::UpdateMembers {
                serialized_members: initial_members.serialize(),
                cluster_id: cluster_id.to_string(),
            },
        );
        if !journal.append(0, entry)? {
            fatal("bootstrap append of the founding membership entry was refused");
        }
        journal.set_commit_index(0)?;
        Ok(journal)
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn current_term(&self) -> Term {
        self.term_vote.read().0
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.term_vote.read().1.clone()
    }

    pub fn log_start(&self) -> LogIndex {
        self.content.lock().log_start
    }

    pub fn log_size(&self) -> LogIndex {
        self.content.lock().log_size
    }

    pub fn commit_index(&self) -> LogIndex {
        *self.commit_index.read()
    }

    pub fn membership(&self) -> Membership {
        self.members.read().current.clone()
    }

    pub fn fsync_policy(&self) -> FsyncPolicy {
        *self.fsync_policy.read()
    }

    /// Changes the durability policy for future appends. Takes effect
    /// immediately; does not retroactively fsync already-written entries.
    pub fn set_fsync_policy(&self, policy: FsyncPolicy) {
        *self.fsync_policy.write() = policy;
    }

    /// Succeeds only if `index == logSize`, `entry.term <= currentTerm`, and
    /// `entry.term >= termOfLastEntry`. Installs membership immediately if
    /// the entry is a matching `UPDATE_MEMBERS`. Wakes log-update waiters.
    pub fn append(&self, index: LogIndex, entry: LogEntry) -> Result<bool> {
        let current_term = self.current_term();
        if entry.term > current_term {
            return Ok(false);
        }

        let mut content = self.content.lock();
        if index != content.log_size {
            return Ok(false);
        }

        if content.log_size > content.log_start {
            if let Some(last) = self.store.get(&entry_key(content.log_size - 1)) {
                let last_entry = LogEntry::deserialize(&last)?;
                if entry.term < last_entry.term {
                    return Ok(false);
                }
            }
        }

        if let Command::UpdateMembers { serialized_members, cluster_id } = &entry.command {
            if cluster_id == &self.cluster_id {
                let new_membership = Membership::deserialize(serialized_members, index);
                let mut members = self.members.write();
                let old_epoch = members.current.epoch;
                let old = members.current.clone();
                members.previous = Some(old);
                members.previous_epoch = Some(old_epoch);
                members.current = new_membership;
                self.persist_members(&members)?;
            }
        }

        self.store.put(&entry_key(index), &entry.serialize())?;
        content.log_size = index + 1;
        self.store.put(KEY_LOG_SIZE, &content.log_size.to_le_bytes())?;
        drop(content);

        let sync_policy = if entry.command.is_control() {
            FsyncPolicy::Always
        } else {
            *self.fsync_policy.read()
        };
        self.store.fsync(sync_policy)?;

        self.log_updated.notify_waiters();
        Ok(true)
    }

    fn persist_members(&self, members: &MembersState) -> Result<()> {
        self.store.put(KEY_MEMBERS, members.current.serialize().as_bytes())?;
        self.store.put(KEY_MEMBERSHIP_EPOCH, &members.current.epoch.to_le_bytes())?;
        if let Some(prev) = &members.previous {
            self.store.put(KEY_PREVIOUS_MEMBERS, prev.serialize().as_bytes())?;
        }
        if let Some(epoch) = members.previous_epoch {
            self.store.put(KEY_PREVIOUS_MEMBERSHIP_EPOCH, &epoch.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn fetch(&self, index: LogIndex) -> Result<LogEntry> {
        let raw = self
            .store
            .get(&entry_key(index))
            .ok_or_else(|| DbError::NotFound(format!("log index {index}")))?;
        LogEntry::deserialize(&raw)
    }

    /// True iff an entry exists at `index` with exactly that term.
    pub fn match_entries(&self, index: LogIndex, term: Term) -> bool {
        match self.fetch(index) {
            Ok(entry) => entry.term == term,
            Err(_) => false,
        }
    }

    /// First index in `[start, start+candidates.len())` whose stored entry
    /// differs from the candidate, or the end index if all match. Indices
    /// that have been trimmed out count as matching, with a warning — a
    /// known compromise (spec.md §9).
    pub fn compare_entries(&self, start: LogIndex, candidates: &[LogEntry]) -> LogIndex {
        let log_start = self.log_start();
        for (offset, candidate) in candidates.iter().enumerate() {
            let index = start + offset as LogIndex;
            if index < log_start {
                tracing::warn!(index, "compareEntries: index already trimmed, assuming match");
                continue;
            }
            match self.fetch(index) {
                Ok(existing) if &existing == candidate => continue,
                _ => return index,
            }
        }
        start + candidates.len() as LogIndex
    }

    /// Truncates the tail `[from, logSize)`. An attempt to remove committed
    /// entries is a fatal integrity violation (spec.md §7).
    pub fn remove_entries(&self, from: LogIndex) -> Result<bool> {
        let mut content = self.content.lock();
        if from <= self.commit_index() {
            fatal(format!(
                "attempt to remove committed entries: from={from} commitIndex={}",
                self.commit_index()
            ));
        }
        self.store.delete_range(from, content.log_size)?;
        content.log_size = from;
        self.store.put(KEY_LOG_SIZE, &from.to_le_bytes())?;

        let mut members = self.members.write();
        if from <= members.current.epoch {
            if let Some(previous) = members.previous.take() {
                members.current = previous;
                members.previous_epoch = None;
                self.persist_members(&members)?;
            }
        }
        Ok(true)
    }

    /// Monotone. Rejects `newIndex >= logSize`. Logs critical and refuses
    /// (without aborting) on an attempted regression. Notifies commit
    /// waiters on advance.
    pub fn set_commit_index(&self, new_index: LogIndex) -> Result<bool> {
        let log_size = self.log_size();
        if new_index >= log_size && log_size > 0 {
            return Ok(false);
        }
        let mut commit_index = self.commit_index.write();
        if new_index < *commit_index {
            tracing::error!(
                attempted = new_index,
                current = *commit_index,
                "commit index regression attempt refused"
            );
            return Ok(false);
        }
        if new_index == *commit_index {
            return Ok(true);
        }
        *commit_index = new_index;
        self.store.put(KEY_COMMIT_INDEX, &new_index.to_le_bytes())?;
        drop(commit_index);
        self.commit_updated.notify_waiters();
        Ok(true)
    }

    /// Monotone in term. Within the same term, vote may be set once (empty
    /// -> concrete); attempts to change a non-empty vote fail.
    pub fn set_current_term(&self, term: Term, vote: Option<NodeId>) -> Result<bool> {
        let mut term_vote = self.term_vote.write();
        if term < term_vote.0 {
            return Ok(false);
        }
        if term > term_vote.0 {
            *term_vote = (term, vote.clone());
            self.store.put(KEY_CURRENT_TERM, &term.to_le_bytes())?;
            self.store
                .put(KEY_VOTED_FOR, vote.unwrap_or_default().as_bytes())?;
            return Ok(true);
        }
        match (&term_vote.1, &vote) {
            (_, None) => Ok(true),
            (None, Some(v)) => {
                term_vote.1 = Some(v.clone());
                self.store.put(KEY_VOTED_FOR, v.as_bytes())?;
                Ok(true)
            }
            (Some(existing), Some(v)) if existing == v => Ok(true),
            (Some(_), Some(_)) => Ok(false),
        }
    }

    /// Prefix-trim. Fails if `newLogStart > commitIndex`.
    pub fn trim_until(&self, new_log_start: LogIndex) -> Result<bool> {
        let mut content = self.content.lock();
        if new_log_start > self.commit_index() {
            return Ok(false);
        }
        if new_log_start <= content.log_start {
            return Ok(true);
        }
        self.store.delete_range(content.log_start, new_log_start)?;
        content.log_start = new_log_start;
        self.store.put(KEY_LOG_START, &new_log_start.to_le_bytes())?;
        Ok(true)
    }

    fn membership_update(&self, term: Term, new_membership: Membership) -> Result<bool> {
        let current_epoch = self.members.read().current.epoch;
        if current_epoch > self.commit_index() {
            return Err(DbError::MembershipBlocked(
                "previous membership epoch is not yet committed".to_string(),
            ));
        }
        let index = self.log_size();
        let entry = LogEntry::new(
            term,
            Command::UpdateMembers {
                serialized_members: new_membership.serialize(),
                cluster_id: self.cluster_id.clone(),
            },
        );
        self.append(index, entry)
    }

    pub fn add_observer(&self, term: Term, observer: NodeId) -> Result<bool> {
        let new_membership = self.members.read().current.with_observer_added(observer);
        self.membership_update(term, new_membership)
    }

    /// Refuses if the observer's match index has not caught up to
    /// `logSize - 1` — the precondition from spec.md §8 Scenario 4.
    pub fn promote_observer(&self, term: Term, observer: &str, observer_match_index: LogIndex) -> Result<bool> {
        if observer_match_index + 1 < self.log_size() {
            return Err(DbError::MembershipBlocked(
                "observer is not up-to-date".to_string(),
            ));
        }
        let new_membership = self.members.read().current.with_observer_promoted(observer);
        self.membership_update(term, new_membership)
    }

    pub fn remove_member(&self, term: Term, member: &str) -> Result<bool> {
        let new_membership = self.members.read().current.with_member_removed(member);
        self.membership_update(term, new_membership)
    }

    pub fn append_leadership_marker(&self, index: LogIndex, term: Term, leader: NodeId) -> Result<bool> {
        self.append(index, LogEntry::new(term, Command::LeadershipMarker { term, leader }))
    }

    /// Waits until `logSize` changes from `current_size`, or `timeout`
    /// elapses. Returns `true` if woken by an update.
    pub async fn wait_for_updates(&self, current_size: LogIndex, timeout: Duration) -> bool {
        if self.log_size() != current_size {
            return true;
        }
        let notified = self.log_updated.notified();
        tokio::pin!(notified);
        if self.log_size() != current_size {
            return true;
        }
        matches!(tokio_timeout(timeout, notified).await, Ok(())) || self.log_size() != current_size
    }

    /// Waits until `commitIndex` advances past `current_commit`. Returns
    /// the new commit index.
    pub async fn wait_for_commits(&self, current_commit: LogIndex) -> LogIndex {
        loop {
            let notified = self.commit_updated.notified();
            tokio::pin!(notified);
            let now = self.commit_index();
            if now > current_commit {
                return now;
            }
            notified.await;
            let now = self.commit_index();
            if now > current_commit {
                return now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::storage::MemoryStore;
    use std::collections::BTreeSet;

    fn members(nodes: &[&str]) -> Membership {
        Membership::new(nodes.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(), BTreeSet::new(), 0)
    }

    fn fresh_journal() -> Journal {
        Journal::open(
            Arc::new(MemoryStore::new()),
            "cluster-1",
            members(&["a:1", "b:2", "c:3"]),
            FsyncPolicy::Always,
        )
        .unwrap()
    }

    #[test]
    fn bootstrap_installs_founding_membership_at_index_zero() {
        let journal = fresh_journal();
        assert_eq!(journal.log_size(), 1);
        assert_eq!(journal.commit_index(), 0);
        assert_eq!(journal.membership().nodes.len(), 3);
        let entry = journal.fetch(0).unwrap();
        assert!(matches!(entry.command, Command::UpdateMembers { .. }));
    }

    #[test]
    fn append_rejects_out_of_order_index() {
        let journal = fresh_journal();
        let entry = LogEntry::new(0, Command::Data(vec![b"X".to_vec()]));
        assert!(!journal.append(5, entry).unwrap());
    }

    #[test]
    fn append_then_fetch_round_trips() {
        let journal = fresh_journal();
        let entry = LogEntry::new(0, Command::Data(vec![b"SET".to_vec()]));
        assert!(journal.append(1, entry.clone()).unwrap());
        assert_eq!(journal.fetch(1).unwrap(), entry);
        assert_eq!(journal.log_size(), 2);
    }

    #[test]
    fn match_entries_checks_term_exactly() {
        let journal = fresh_journal();
        journal.append(1, LogEntry::new(0, Command::Data(vec![]))).unwrap();
        assert!(journal.match_entries(1, 0));
        assert!(!journal.match_entries(1, 1));
        assert!(!journal.match_entries(99, 0));
    }

    #[test]
    fn remove_entries_refuses_to_touch_committed_prefix() {
        let journal = fresh_journal();
        journal.append(1, LogEntry::new(0, Command::Data(vec![]))).unwrap();
        journal.set_commit_index(1).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| journal.remove_entries(1)));
        assert!(result.is_err());
    }

    #[test]
    fn remove_entries_truncates_uncommitted_tail() {
        let journal = fresh_journal();
        journal.append(1, LogEntry::new(0, Command::Data(vec![]))).unwrap();
        journal.append(2, LogEntry::new(0, Command::Data(vec![]))).unwrap();
        assert!(journal.remove_entries(1).unwrap());
        assert_eq!(journal.log_size(), 1);
        assert!(journal.fetch(1).is_err());
    }

    #[test]
    fn set_commit_index_rejects_beyond_log_size() {
        let journal = fresh_journal();
        assert!(!journal.set_commit_index(5).unwrap());
    }

    #[test]
    fn set_commit_index_refuses_regression() {
        let journal = fresh_journal();
        journal.append(1, LogEntry::new(0, Command::Data(vec![]))).unwrap();
        journal.set_commit_index(1).unwrap();
        assert!(!journal.set_commit_index(0).unwrap());
        assert_eq!(journal.commit_index(), 1);
    }

    #[test]
    fn set_current_term_is_monotone_and_vote_is_single_shot() {
        let journal = fresh_journal();
        assert!(journal.set_current_term(1, Some("a:1".into())).unwrap());
        assert!(!journal.set_current_term(0, None).unwrap());
        assert!(!journal.set_current_term(1, Some("b:2".into())).unwrap());
        assert!(journal.set_current_term(1, Some("a:1".into())).unwrap());
    }

    #[test]
    fn trim_until_refuses_past_commit_index() {
        let journal = fresh_journal();
        assert!(!journal.trim_until(5).unwrap());
    }

    #[test]
    fn reopen_restores_term_vote_and_membership() {
        let store = Arc::new(MemoryStore::new());
        let initial = members(&["a:1", "b:2"]);
        {
            let journal = Journal::open(store.clone(), "cluster-1", initial.clone(), FsyncPolicy::Always).unwrap();
            journal.set_current_term(7, Some("a:1".into())).unwrap();
        }
        let reopened = Journal::open(store, "cluster-1", initial, FsyncPolicy::Always).unwrap();
        assert_eq!(reopened.current_term(), 7);
        assert_eq!(reopened.voted_for(), Some("a:1".to_string()));
        assert_eq!(reopened.membership().nodes.len(), 2);
    }

    #[test]
    fn promote_observer_blocked_until_caught_up() {
        let journal = fresh_journal();
        journal.add_observer(0, "d:4".into()).unwrap();
        journal.set_commit_index(1).unwrap();
        let err = journal.promote_observer(0, "d:4", 0).unwrap_err();
        assert!(matches!(err, DbError::MembershipBlocked(_)));
    }

    #[tokio::test]
    async fn wait_for_updates_wakes_on_append() {
        let journal = Arc::new(fresh_journal());
        let size = journal.log_size();
        let waiter = tokio::spawn({
            let journal = journal.clone();
            async move { journal.wait_for_updates(size, Duration::from_secs(1)).await }
        });
        tokio::task::yield_now().await;
        journal.append(size, LogEntry::new(0, Command::Data(vec![]))).unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_commits_wakes_on_advance() {
        let journal = Arc::new(fresh_journal());
        journal.append(1, LogEntry::new(0, Command::Data(vec![]))).unwrap();
        let waiter = tokio::spawn({
            let journal = journal.clone();
            async move { journal.wait_for_commits(0).await }
        });
        tokio::task::yield_now().await;
        journal.set_commit_index(1).unwrap();
        assert_eq!(waiter.await.unwrap(), 1);
    }
}

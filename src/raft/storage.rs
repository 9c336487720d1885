//! The persisted key-value layout backing the journal (spec.md §6).
//!
//! The real on-disk engine (a rocksdb-like store, per spec.md §5) is an
//! external collaborator — "the on-disk key encoding inside the state
//! machine" is explicitly out of scope (spec.md §1). `JournalStore` is the
//! trait boundary the [`super::journal::Journal`] is built against; the
//! in-memory implementation here is what a test harness or an all-in-one
//! single-process deployment uses.

use crate::config::FsyncPolicy;
use crate::error::Result;
use crate::raft::types::LogIndex;
use parking_lot::Mutex;
use std::collections::BTreeMap;

pub const KEY_CURRENT_TERM: &[u8] = b"JOURNAL/CURRENT_TERM";
pub const KEY_VOTED_FOR: &[u8] = b"JOURNAL/VOTED_FOR";
pub const KEY_LOG_SIZE: &[u8] = b"JOURNAL/LOG_SIZE";
pub const KEY_LOG_START: &[u8] = b"JOURNAL/LOG_START";
pub const KEY_COMMIT_INDEX: &[u8] = b"JOURNAL/COMMIT_INDEX";
pub const KEY_CLUSTER_ID: &[u8] = b"JOURNAL/CLUSTER_ID";
pub const KEY_MEMBERS: &[u8] = b"JOURNAL/MEMBERS";
pub const KEY_MEMBERSHIP_EPOCH: &[u8] = b"JOURNAL/MEMBERSHIP_EPOCH";
pub const KEY_PREVIOUS_MEMBERS: &[u8] = b"JOURNAL/PREVIOUS_MEMBERS";
pub const KEY_PREVIOUS_MEMBERSHIP_EPOCH: &[u8] = b"JOURNAL/PREVIOUS_MEMBERSHIP_EPOCH";

/// `'E' || big-endian(index)` so key iteration order equals log order.
pub fn entry_key(index: LogIndex) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'E');
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Storage backend underlying the journal. All integers are stored as
/// fixed-width little-endian bytes by convention (spec.md §6); keys are
/// opaque to callers above this trait.
pub trait JournalStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// Deletes every key in `[entry_key(from), entry_key(to))`.
    fn delete_range(&self, from: LogIndex, to: LogIndex) -> Result<()>;
    /// Forces pending writes to stable storage. A no-op for stores that are
    /// already synchronous, as the in-memory store is.
    fn fsync(&self, policy: FsyncPolicy) -> Result<()>;
}

/// An in-memory `JournalStore`. Every write is immediately visible and
/// durable only for the lifetime of the process — adequate for the core's
/// own test suite and for embedding in a single-process deployment where
/// durability is handled by a higher layer.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JournalStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.lock().get(key).cloned()
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.lock().remove(key);
        Ok(())
    }

    fn delete_range(&self, from: LogIndex, to: LogIndex) -> Result<()> {
        let mut map = self.map.lock();
        let keys: Vec<Vec<u8>> = map
            .range(entry_key(from)..entry_key(to))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            map.remove(&key);
        }
        Ok(())
    }

    fn fsync(&self, _policy: FsyncPolicy) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_keys_sort_in_log_order() {
        let mut keys = vec![entry_key(10), entry_key(2), entry_key(256)];
        keys.sort();
        assert_eq!(keys, vec![entry_key(2), entry_key(10), entry_key(256)]);
    }

    #[test]
    fn memory_store_put_get_delete() {
        let store = MemoryStore::new();
        store.put(KEY_CURRENT_TERM, &5u64.to_le_bytes()).unwrap();
        assert_eq!(store.get(KEY_CURRENT_TERM), Some(5u64.to_le_bytes().to_vec()));
        store.delete(KEY_CURRENT_TERM).unwrap();
        assert_eq!(store.get(KEY_CURRENT_TERM), None);
    }

    #[test]
    fn delete_range_removes_only_selected_entries() {
        let store = MemoryStore::new();
        for i in 0..5u64 {
            store.put(&entry_key(i), b"x").unwrap();
        }
        store.delete_range(2, 4).unwrap();
        assert!(store.get(&entry_key(1)).is_some());
        assert!(store.get(&entry_key(2)).is_none());
        assert!(store.get(&entry_key(3)).is_none());
        assert!(store.get(&entry_key(4)).is_some());
    }
}

//! Process-wide configuration.
//!
//! Construction from a config file or environment is an external-collaborator
//! concern (CLI tooling, out of scope per spec.md §1); this module only
//! defines the struct and its defaults, following the plain `Config` +
//! `Default` convention from the workspace root `lib.rs`.

use std::time::Duration;

/// Durability knob for the journal (spec.md §4.1).
///
/// `SyncImportantUpdates` fsyncs term/vote and membership changes but
/// batches data fsyncs — the middle ground the original system defaults to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    Always,
    Async,
    SyncImportantUpdates,
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::SyncImportantUpdates
    }
}

/// Raft timing and sizing knobs.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout window.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout window.
    pub election_timeout_max: Duration,
    /// Interval between heartbeats sent by a leader to each follower.
    pub heartbeat_interval: Duration,
    /// Duration added to the quorum-freshness timestamp to compute the
    /// leader's lease deadline.
    pub lease_duration: Duration,
    /// Maximum in-flight append-entries batches per follower (pipelining
    /// window, spec.md §4.6).
    pub replication_pipeline_depth: usize,
    /// Maximum entries batched into one append-entries call.
    pub max_batch_entries: usize,
    /// Maximum bytes batched into one append-entries call.
    pub max_batch_bytes: usize,
    /// Durability knob for the journal.
    pub fsync_policy: FsyncPolicy,
    /// Whether followers answer reads directly without redirecting to the
    /// leader (`ACTIVATE_STALE_READS`).
    pub stale_reads: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            lease_duration: Duration::from_secs(2),
            replication_pipeline_depth: 8,
            max_batch_entries: 256,
            max_batch_bytes: 1 << 20,
            fsync_policy: FsyncPolicy::default(),
            stale_reads: false,
        }
    }
}

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: String,
    pub data_dir: String,
    pub port: u16,
    pub raft: RaftConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "127.0.0.1:7777".to_string(),
            data_dir: "./data".to_string(),
            port: 7777,
            raft: RaftConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsync_policy_defaults_to_important_updates() {
        assert_eq!(RaftConfig::default().fsync_policy, FsyncPolicy::SyncImportantUpdates);
    }

    #[test]
    fn election_timeout_window_is_well_formed() {
        let cfg = RaftConfig::default();
        assert!(cfg.election_timeout_min < cfg.election_timeout_max);
    }
}

//! Tracks the most-recent heartbeat timestamp and a randomized election
//! timeout (spec.md §4.3). Grounded on QuarkDB's `RaftHeartbeatTracker`
//! (referenced throughout `RaftDirector.cc`) and `ElectionManager`'s
//! randomized-timeout fields in `networking/membership/raft/election.rs`.

use crate::config::RaftConfig;
use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};

pub struct HeartbeatTracker {
    config: RaftConfig,
    state: Mutex<State>,
}

struct State {
    last_heartbeat: Instant,
    current_timeout: Duration,
}

impl HeartbeatTracker {
    pub fn new(config: RaftConfig) -> Self {
        let initial_timeout = Self::random_timeout(&config);
        Self {
            config,
            state: Mutex::new(State {
                last_heartbeat: Instant::now(),
                current_timeout: initial_timeout,
            }),
        }
    }

    fn random_timeout(config: &RaftConfig) -> Duration {
        let min = config.election_timeout_min.as_millis() as u64;
        let max = config.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Advances the last-heartbeat timestamp. Monotone: a stale `now` is
    /// silently ignored.
    pub fn heartbeat(&self, now: Instant) {
        let mut state = self.state.lock();
        if now > state.last_heartbeat {
            state.last_heartbeat = now;
        }
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.state.lock().last_heartbeat
    }

    pub fn timeout(&self, now: Instant) -> bool {
        let state = self.state.lock();
        now.duration_since(state.last_heartbeat) >= state.current_timeout
    }

    pub fn refresh_random_timeout(&self) {
        let new_timeout = Self::random_timeout(&self.config);
        self.state.lock().current_timeout = new_timeout;
    }

    /// Forces `timeout()` to report true — used by `RAFT_ATTEMPT_COUP`.
    pub fn trigger_timeout(&self) {
        let mut state = self.state.lock();
        state.last_heartbeat = Instant::now() - state.current_timeout - Duration::from_millis(1);
    }

    pub fn current_timeout(&self) -> Duration {
        self.state.lock().current_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_is_not_timed_out() {
        let tracker = HeartbeatTracker::new(RaftConfig::default());
        assert!(!tracker.timeout(Instant::now()));
    }

    #[test]
    fn heartbeat_is_monotone() {
        let tracker = HeartbeatTracker::new(RaftConfig::default());
        let first = tracker.last_heartbeat();
        tracker.heartbeat(first - Duration::from_secs(10));
        assert_eq!(tracker.last_heartbeat(), first);
    }

    #[test]
    fn trigger_timeout_forces_timeout_true() {
        let tracker = HeartbeatTracker::new(RaftConfig::default());
        tracker.trigger_timeout();
        assert!(tracker.timeout(Instant::now()));
    }

    #[test]
    fn random_timeout_stays_within_configured_window() {
        let config = RaftConfig::default();
        let tracker = HeartbeatTracker::new(config.clone());
        let t = tracker.current_timeout();
        assert!(t >= config.election_timeout_min && t <= config.election_timeout_max);
    }
}

//! Cluster membership: voting nodes, observers, and the epoch that
//! installed them (spec.md §3, §6). Grounded on QuarkDB's `RaftMembers.hh`
//! (the internal `{nodes, observers}` pair with add/remove/promote) and
//! the public `RaftMembership{nodes, observers, epoch}` snapshot type.

use crate::common::NodeId;
use std::collections::BTreeSet;

/// A membership snapshot: the voting set, the observer set, and the log
/// index of the entry that installed them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Membership {
    pub nodes: BTreeSet<NodeId>,
    pub observers: BTreeSet<NodeId>,
    pub epoch: u64,
}

impl Membership {
    pub fn new(nodes: BTreeSet<NodeId>, observers: BTreeSet<NodeId>, epoch: u64) -> Self {
        Self { nodes, observers, epoch }
    }

    /// `host:port,host:port|host:port,host:port` — voting nodes before the
    /// pipe, observers after (spec.md §6).
    pub fn serialize(&self) -> String {
        let nodes: Vec<&str> = self.nodes.iter().map(|s| s.as_str()).collect();
        let observers: Vec<&str> = self.observers.iter().map(|s| s.as_str()).collect();
        format!("{}|{}", nodes.join(","), observers.join(","))
    }

    pub fn deserialize(s: &str, epoch: u64) -> Self {
        let mut parts = s.splitn(2, '|');
        let nodes_part = parts.next().unwrap_or("");
        let observers_part = parts.next().unwrap_or("");
        let parse = |part: &str| -> BTreeSet<NodeId> {
            part.split(',').filter(|s| !s.is_empty()).map(String::from).collect()
        };
        Membership::new(parse(nodes_part), parse(observers_part), epoch)
    }

    pub fn quorum_size(&self) -> usize {
        quorum_size(self.nodes.len())
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains(node) || self.observers.contains(node)
    }

    pub fn is_voting_member(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    /// A node with empty voting and observer sets — a bootstrap race or a
    /// mis-wired config. The director logs this distinctly from "observer
    /// not yet promoted" and never elects in either case.
    pub fn in_limbo(&self) -> bool {
        self.nodes.is_empty() && self.observers.is_empty()
    }

    pub fn with_observer_added(&self, observer: NodeId) -> Membership {
        let mut observers = self.observers.clone();
        observers.insert(observer);
        Membership::new(self.nodes.clone(), observers, self.epoch)
    }

    pub fn with_observer_promoted(&self, observer: &str) -> Membership {
        let mut nodes = self.nodes.clone();
        let mut observers = self.observers.clone();
        observers.remove(observer);
        nodes.insert(observer.to_string());
        Membership::new(nodes, observers, self.epoch)
    }

    pub fn with_member_removed(&self, member: &str) -> Membership {
        let mut nodes = self.nodes.clone();
        let mut observers = self.observers.clone();
        nodes.remove(member);
        observers.remove(member);
        Membership::new(nodes, observers, self.epoch)
    }

    pub fn at_epoch(&self, epoch: u64) -> Membership {
        Membership::new(self.nodes.clone(), self.observers.clone(), epoch)
    }
}

/// Quorum size for `n` voting members: `floor(n/2) + 1`.
pub fn quorum_size(n: usize) -> usize {
    n / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<NodeId> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn serialize_round_trips() {
        let m = Membership::new(set(&["a:1", "b:2"]), set(&["c:3"]), 7);
        let s = m.serialize();
        assert_eq!(s, "a:1,b:2|c:3");
        let back = Membership::deserialize(&s, 7);
        assert_eq!(m, back);
    }

    #[test]
    fn empty_membership_round_trips() {
        let m = Membership::default();
        assert_eq!(m.serialize(), "|");
        let back = Membership::deserialize("|", 0);
        assert_eq!(m, back);
        assert!(back.in_limbo());
    }

    #[test]
    fn quorum_size_matches_spec_formula() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn promote_moves_observer_to_voting_set() {
        let m = Membership::new(set(&["a:1"]), set(&["d:4"]), 0);
        let promoted = m.with_observer_promoted("d:4");
        assert!(promoted.is_voting_member("d:4"));
        assert!(!promoted.observers.contains("d:4"));
    }

    #[test]
    fn remove_member_drops_from_both_sets() {
        let m = Membership::new(set(&["a:1", "b:2"]), set(&["c:3"]), 0);
        let removed = m.with_member_removed("b:2");
        assert!(!removed.contains("b:2"));
        assert!(removed.contains("a:1"));
    }
}

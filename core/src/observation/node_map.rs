//! Per-host work queue for one task.
//!
//! `NodeCommandMap` is the single source of truth for "is there more work".
//! It is owned by the orchestrator's event loop; every context that needs to
//! change it (connection results, worker exits) does so by sending the
//! orchestrator an event, so calls are never truly concurrent.

use std::collections::{HashMap, VecDeque};

use super::clustered::{ClusterItem, ClusteredObservation};


#[derive(Debug, Default)]
pub struct NodeCommandMap {
    queues: HashMap<String, VecDeque<ClusterItem>>,
    current: HashMap<String, ClusterItem>,
}

impl NodeCommandMap {
    pub fn new() -> NodeCommandMap {
        NodeCommandMap::default()
    }

    /// Group all shards by host, preserving descriptor order within a host.
    /// Replaces whatever the map held before.
    pub fn initialize(&mut self, observation: &ClusteredObservation) {
        self.queues.clear();
        self.current.clear();
        for item in observation.items() {
            self.queues
                .entry(item.hostname.clone())
                .or_default()
                .push_back(item.clone());
        }
    }

    /// Take the next shard for `hostname` and remember it as current.
    ///
    /// When the host's queue is already empty the host is dropped from the
    /// map and `None` is returned.
    pub fn pop(&mut self, hostname: &str) -> Option<ClusterItem> {
        let queue = self.queues.get_mut(hostname)?;
        match queue.pop_front() {
            Some(item) => {
                self.current.insert(hostname.to_string(), item.clone());
                Some(item)
            }
            None => {
                self.queues.remove(hostname);
                self.current.remove(hostname);
                None
            }
        }
    }

    /// The shard most recently popped for `hostname`, if the host is still
    /// known.
    pub fn current(&self, hostname: &str) -> Option<&ClusterItem> {
        self.current.get(hostname)
    }

    /// Drop a host entirely. Returns whether it was present.
    pub fn remove_node(&mut self, hostname: &str) -> bool {
        self.current.remove(hostname);
        self.queues.remove(hostname).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.queues.contains_key(hostname)
    }

    /// Shards still queued for `hostname` (not counting the current one).
    pub fn remaining(&self, hostname: &str) -> usize {
        self.queues.get(hostname).map(|q| q.len()).unwrap_or(0)
    }

    pub fn hostnames(&self) -> Vec<&str> {
        self.queues.keys().map(|h| h.as_str()).collect()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn observation() -> ClusteredObservation {
        let mut obs = ClusteredObservation::new();
        obs.add_item("/d/sb0.ms", "n1");
        obs.add_item("/d/sb1.ms", "n2");
        obs.add_item("/d/sb2.ms", "n1");
        obs
    }

    #[test]
    fn pop_follows_descriptor_order_per_host() {
        let mut map = NodeCommandMap::new();
        map.initialize(&observation());
        assert_eq!(map.pop("n1").unwrap().local_path, "/d/sb0.ms");
        assert_eq!(map.pop("n1").unwrap().local_path, "/d/sb2.ms");
        assert_eq!(map.pop("n2").unwrap().index, 1);
    }

    #[test]
    fn exhausted_host_disappears() {
        let mut map = NodeCommandMap::new();
        map.initialize(&observation());
        assert!(map.pop("n2").is_some());
        assert!(map.contains("n2"));
        assert!(map.pop("n2").is_none());
        assert!(!map.contains("n2"));
        assert!(map.current("n2").is_none());
        assert!(map.pop("n2").is_none());
    }

    #[test]
    fn empty_only_after_every_host_is_exhausted() {
        let mut map = NodeCommandMap::new();
        map.initialize(&observation());
        while map.pop("n1").is_some() {}
        assert!(!map.is_empty());
        while map.pop("n2").is_some() {}
        assert!(map.is_empty());
    }

    #[test]
    fn current_is_visible_only_after_pop() {
        let mut map = NodeCommandMap::new();
        map.initialize(&observation());
        assert!(map.current("n1").is_none());
        map.pop("n1");
        assert_eq!(map.current("n1").unwrap().index, 0);
        map.pop("n1");
        assert_eq!(map.current("n1").unwrap().index, 2);
    }

    #[test]
    fn current_for_unknown_host() {
        let map = NodeCommandMap::new();
        assert!(map.current("ghost").is_none());
    }

    #[test]
    fn remove_node_drops_queue_and_current() {
        let mut map = NodeCommandMap::new();
        map.initialize(&observation());
        map.pop("n1");
        assert!(map.remove_node("n1"));
        assert!(!map.remove_node("n1"));
        assert!(map.current("n1").is_none());
        assert!(map.pop("n1").is_none());
        assert_eq!(map.hostnames(), vec!["n2"]);
    }

    #[test]
    fn initialize_resets_previous_state() {
        let mut map = NodeCommandMap::new();
        map.initialize(&observation());
        map.remove_node("n2");
        map.pop("n1");
        map.initialize(&observation());
        assert_eq!(map.remaining("n1"), 2);
        assert_eq!(map.remaining("n2"), 1);
        assert!(map.current("n1").is_none());
    }

    #[test]
    fn interleaved_pops_and_removals() {
        let mut map = NodeCommandMap::new();
        map.initialize(&observation());
        map.pop("n1");
        map.remove_node("n2");
        map.pop("n1");
        assert!(!map.is_empty());
        assert!(map.pop("n1").is_none());
        assert!(map.is_empty());
    }
}

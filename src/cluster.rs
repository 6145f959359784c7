// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node/plug arena (spec §3, §9). Plugs are owned by their `Device`; nodes
//! are owned by the `Cluster`. Back-edges (plug -> node, node -> plug) are
//! stable integer handles, not owning pointers, per spec §9's "Cyclic
//! ownership" note — the arena-handle idiom here is grounded on
//! `AidanWoolley-catnip/src/file_table.rs`'s `slab::Slab` + typed-handle
//! pattern rather than `Rc<RefCell<_>>` back-references.

use std::time::{Duration, Instant};

use slab::Slab;

use crate::device::{DeviceId, PlugHandle};

/// Hard power (plug) or soft power / liveness (node) state. Initializes to
/// `Unknown` and only ever becomes `On`/`Off` via a successful EXPECT
/// capture (spec §3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    #[default]
    Unknown,
    On,
    Off,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

/// Stable handle into the cluster's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub usize);

/// A logical managed cluster member (spec §3). May be bound to a device for
/// hard power (plug state) and, independently, to a (possibly different)
/// device for soft power / liveness (node state) — SPEC_FULL §3.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub plug_state: PowerState,
    pub hard: Option<(DeviceId, PlugHandle)>,
    pub node_state: PowerState,
    pub soft: Option<(DeviceId, PlugHandle)>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plug_state: PowerState::Unknown,
            hard: None,
            node_state: PowerState::Unknown,
            soft: None,
        }
    }
}

/// Owning arena for `Node`s, plus the periodic-refresh throttle (spec
/// §4.6 and `original_source/src/config.h`'s `Cluster.update_interval`).
pub struct Cluster {
    pub name: String,
    nodes: Slab<Node>,
    by_name: std::collections::HashMap<String, NodeHandle>,
    pub update_interval: Duration,
    pub last_update: Option<Instant>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, update_interval: Duration) -> Self {
        Self {
            name: name.into(),
            nodes: Slab::new(),
            by_name: std::collections::HashMap::new(),
            update_interval,
            last_update: None,
        }
    }

    pub fn insert(&mut self, node: Node) -> NodeHandle {
        let name = node.name.clone();
        let key = self.nodes.insert(node);
        let handle = NodeHandle(key);
        self.by_name.insert(name, handle);
        handle
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.nodes.get_mut(handle.0)
    }

    pub fn find(&self, name: &str) -> Option<NodeHandle> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.nodes.iter().map(|(k, v)| (NodeHandle(k), v))
    }

    /// Whether a refresh is due: throttled so back-to-back refreshes never
    /// overlap more tightly than `update_interval` (spec §4.6).
    pub fn refresh_due(&self, now: Instant) -> bool {
        match self.last_update {
            None => true,
            Some(last) => now.duration_since(last) >= self.update_interval,
        }
    }

    pub fn mark_refreshed(&mut self, now: Instant) {
        self.last_update = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_find_roundtrip() {
        let mut cluster = Cluster::new("test", Duration::from_secs(100));
        let handle = cluster.insert(Node::new("n0"));
        assert_eq!(cluster.find("n0"), Some(handle));
        assert_eq!(cluster.get(handle).unwrap().name, "n0");
    }

    #[test]
    fn fresh_cluster_is_refresh_due() {
        let cluster = Cluster::new("test", Duration::from_secs(100));
        assert!(cluster.refresh_due(Instant::now()));
    }

    #[test]
    fn refresh_throttled_until_interval_elapses() {
        let mut cluster = Cluster::new("test", Duration::from_millis(50));
        let now = Instant::now();
        cluster.mark_refreshed(now);
        assert!(!cluster.refresh_due(now));
    }

    #[test]
    fn nodes_initialize_unknown() {
        let node = Node::new("n0");
        assert_eq!(node.plug_state, PowerState::Unknown);
        assert_eq!(node.node_state, PowerState::Unknown);
    }
}

//! Cluster node + link registry.
//!
//! State is a triple-map: `nodes` (by UUID), `ids` (by local numeric id),
//! `peers` (the connected subset of `nodes`), all three kept behind one
//! `parking_lot::Mutex<TrackerState>` so a single lock acquisition mutates
//! all three consistently rather than needing a documented lock-ordering
//! discipline across three independent locks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::ebus::{Ebus, Event, PublishFlags};
use crate::ids::{LocalId, NodeId};

use super::node::{Link, Node, Topology};

struct TrackerState {
    nodes: HashMap<NodeId, Node>,
    ids: HashMap<LocalId, NodeId>,
    peers: HashMap<NodeId, ()>,
    links: Vec<Link>,
}

/// The local node's view of the cluster. Owns the current `Topology`
/// snapshot behind an `ArcSwap` so `snapshot()` never blocks a concurrent
/// `link_state` update.
pub struct Tracker {
    self_uuid: NodeId,
    state: Mutex<TrackerState>,
    next_local_id: AtomicU32,
    topology: ArcSwap<Topology>,
    ebus: Arc<Ebus>,
}

impl Tracker {
    pub fn new(self_uuid: NodeId, self_address: SocketAddr, ebus: Arc<Ebus>) -> Arc<Self> {
        let mut nodes = HashMap::new();
        let mut ids = HashMap::new();
        nodes.insert(
            self_uuid,
            Node { uuid: self_uuid, address: self_address, connected: true, active: true, local_id: 0 },
        );
        ids.insert(0, self_uuid);

        Arc::new(Tracker {
            self_uuid,
            state: Mutex::new(TrackerState { nodes, ids, peers: HashMap::new(), links: Vec::new() }),
            next_local_id: AtomicU32::new(1),
            topology: ArcSwap::from_pointee(Topology::empty()),
            ebus,
        })
    }

    pub fn self_uuid(&self) -> NodeId {
        self.self_uuid
    }

    pub fn snapshot(&self) -> Arc<Topology> {
        self.topology.load_full()
    }

    /// Upserts both endpoints, flips the link's connected state, and
    /// rebuilds and publishes a fresh snapshot.
    pub fn link_state(&self, src: NodeId, src_addr: SocketAddr, dst: NodeId, dst_addr: SocketAddr, connected: bool) {
        if src == dst {
            tracing::warn!(?src, "link_state ignored: self-loop");
            return;
        }

        let mut state = self.state.lock();
        let src_id = self.upsert(&mut state, src, src_addr);
        let dst_id = self.upsert(&mut state, dst, dst_addr);

        if connected {
            if !state.links.iter().any(|l| is_same_pair(l, src_id, dst_id)) {
                state.links.push(Link { n1: src_id, n2: dst_id, weight: 1 });
            }
            if let Some(n) = state.nodes.get_mut(&src) {
                n.connected = true;
                n.active = true;
            }
            if let Some(n) = state.nodes.get_mut(&dst) {
                n.connected = true;
                n.active = true;
            }
            state.peers.insert(src, ());
            state.peers.insert(dst, ());
        } else {
            state.links.retain(|l| !is_same_pair(l, src_id, dst_id));
            for uuid in [src, dst] {
                if uuid != self.self_uuid {
                    if let Some(n) = state.nodes.get_mut(&uuid) {
                        n.connected = false;
                    }
                    state.peers.remove(&uuid);
                }
            }
        }

        let snapshot = Topology {
            nodes: state.nodes.values().cloned().collect(),
            links: state.links.clone(),
            extra: String::new(),
        };
        drop(state);

        let snapshot = Arc::new(snapshot);
        self.topology.store(snapshot.clone());

        let _ = self.ebus.publish(Event::LinkState { from: src, src, dst, connected }, PublishFlags::default());
        let _ =
            self.ebus.publish(Event::TopologyChanged { topology: snapshot }, PublishFlags { unique: true });
    }

    /// Is there a connected link between `src` and `dst` in the current
    /// snapshot?
    pub fn is_connected(&self, src: NodeId, dst: NodeId) -> bool {
        let state = self.state.lock();
        let (Some(a), Some(b)) = (
            state.nodes.get(&src).map(|n| n.local_id),
            state.nodes.get(&dst).map(|n| n.local_id),
        ) else {
            return false;
        };
        state.links.iter().any(|l| is_same_pair(l, a, b))
    }

    pub fn is_peer(&self, uuid: NodeId) -> bool {
        self.state.lock().peers.contains_key(&uuid)
    }

    fn upsert(&self, state: &mut TrackerState, uuid: NodeId, address: SocketAddr) -> LocalId {
        if let Some(node) = state.nodes.get(&uuid) {
            return node.local_id;
        }
        let local_id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        state.nodes.insert(uuid, Node { uuid, address, connected: false, active: false, local_id });
        state.ids.insert(local_id, uuid);
        local_id
    }
}

fn is_same_pair(l: &Link, a: LocalId, b: LocalId) -> bool {
    (l.n1 == a && l.n2 == b) || (l.n1 == b && l.n2 == a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    #[tokio::test]
    async fn link_state_connects_and_disconnects() {
        let ebus = Ebus::new(Default::default());
        let me = NodeId::generate();
        let other = NodeId::generate();
        let tracker = Tracker::new(me, addr(), ebus);

        tracker.link_state(me, addr(), other, addr(), true);
        assert!(tracker.is_connected(me, other));

        tracker.link_state(me, addr(), other, addr(), false);
        assert!(!tracker.is_connected(me, other));
    }

    #[tokio::test]
    async fn self_loop_is_ignored() {
        let ebus = Ebus::new(Default::default());
        let me = NodeId::generate();
        let tracker = Tracker::new(me, addr(), ebus);
        tracker.link_state(me, addr(), me, addr(), true);
        assert_eq!(tracker.snapshot().links.len(), 0);
    }

    #[tokio::test]
    async fn snapshot_is_rebuilt_on_every_change() {
        let ebus = Ebus::new(Default::default());
        let me = NodeId::generate();
        let other = NodeId::generate();
        let tracker = Tracker::new(me, addr(), ebus);
        let before = tracker.snapshot();
        tracker.link_state(me, addr(), other, addr(), true);
        let after = tracker.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.nodes.len(), 2);
    }
}

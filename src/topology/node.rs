//! Graph types making up a topology snapshot.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::ids::{LocalId, NodeId};

/// A cluster node as known by the local tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub uuid: NodeId,
    pub address: SocketAddr,
    pub connected: bool,
    pub active: bool,
    pub local_id: LocalId,
}

/// An unordered pair of `local_id`s with an edge weight. Self-loops are
/// rejected by the tracker before a `Link` is ever constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub n1: LocalId,
    pub n2: LocalId,
    pub weight: u32,
}

/// The wire shape of a node entry inside a serialised topology: the two
/// halves of a UUID (`U1`, `U2`) plus its listen address (`A`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub uuid: NodeId,
    pub address: String,
}

/// An immutable cluster snapshot. Built once by the tracker on every
/// topology-affecting event and published via `arc_swap::ArcSwap` so readers
/// never block a writer installing a new one.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
    pub extra: String,
}

impl Topology {
    pub fn empty() -> Self {
        Topology::default()
    }

    pub fn node_by_local_id(&self, id: LocalId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.local_id == id)
    }

    pub fn node_by_uuid(&self, uuid: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.uuid == uuid)
    }

    /// Neighbours of `id` reachable over a single link, with that link's
    /// weight.
    pub fn neighbours(&self, id: LocalId) -> impl Iterator<Item = (LocalId, u32)> + '_ {
        self.links.iter().filter_map(move |l| {
            if l.n1 == id {
                Some((l.n2, l.weight))
            } else if l.n2 == id {
                Some((l.n1, l.weight))
            } else {
                None
            }
        })
    }
}

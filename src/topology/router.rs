//! Shortest-first-hop routing over a `Topology` snapshot.

use std::collections::{BinaryHeap, HashMap};

use crate::ids::{LocalId, NodeId};

use super::node::Topology;

/// `reachable-uuid → next-hop-uuid` for every node reachable from `src`.
/// `src` itself is never present in the map.
pub type Routes = HashMap<NodeId, NodeId>;

#[derive(PartialEq, Eq)]
struct HeapEntry {
    dist: u64,
    local_id: LocalId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the smallest distance
        // first, with ties broken by lower `local_id` directly in the
        // priority order instead of as a separate post-pass.
        other.dist.cmp(&self.dist).then_with(|| other.local_id.cmp(&self.local_id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Dijkstra over `topology`'s link graph, producing the first hop on the
/// shortest path from `src` to every other reachable node. Unreachable nodes
/// are omitted; self is omitted.
pub fn routes(topology: &Topology, src: NodeId) -> Routes {
    let Some(src_node) = topology.node_by_uuid(src) else {
        return Routes::new();
    };
    let src_id = src_node.local_id;

    let mut dist: HashMap<LocalId, u64> = HashMap::new();
    // First hop local_id taken to reach each node from `src`.
    let mut first_hop: HashMap<LocalId, LocalId> = HashMap::new();
    let mut heap = BinaryHeap::new();

    dist.insert(src_id, 0);
    heap.push(HeapEntry { dist: 0, local_id: src_id });

    while let Some(HeapEntry { dist: d, local_id: u }) = heap.pop() {
        if d > *dist.get(&u).unwrap_or(&u64::MAX) {
            continue;
        }
        for (v, weight) in topology.neighbours(u) {
            let nd = d + weight as u64;
            let better = match dist.get(&v) {
                None => true,
                Some(&cur) => nd < cur || (nd == cur && first_hop_tiebreak(&first_hop, u, v, src_id)),
            };
            if better {
                dist.insert(v, nd);
                let hop = if u == src_id { v } else { *first_hop.get(&u).unwrap() };
                first_hop.insert(v, hop);
                heap.push(HeapEntry { dist: nd, local_id: v });
            }
        }
    }

    first_hop
        .into_iter()
        .filter(|&(v, _)| v != src_id)
        .filter_map(|(v, hop)| {
            let v_uuid = topology.node_by_local_id(v)?.uuid;
            let hop_uuid = topology.node_by_local_id(hop)?.uuid;
            Some((v_uuid, hop_uuid))
        })
        .collect()
}

/// When two paths to `v` via different predecessors tie on distance, prefer
/// the one whose first hop has the lower `local_id`.
fn first_hop_tiebreak(first_hop: &HashMap<LocalId, LocalId>, candidate_pred: LocalId, v: LocalId, src_id: LocalId) -> bool {
    let Some(&existing_hop) = first_hop.get(&v) else { return true };
    let candidate_hop = if candidate_pred == src_id { v } else { *first_hop.get(&candidate_pred).unwrap_or(&candidate_pred) };
    candidate_hop < existing_hop
}

//! The fixed event set.

use std::sync::Arc;

use crate::ids::{NodeId, StorageId};
use crate::topology::Topology;

/// One variant per row of the internal events table. `EventKind` is the
/// `u32` discriminant the bus switches on; `as u32` on an `Event` always
/// matches the `EventKind` it was built from (enforced by
/// [`Event::discriminant`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventKind {
    BroadcastPost = 0,
    Broadcast = 1,
    LinkState = 2,
    LinkCheck = 3,
    Topology = 4,
    TopologyChanged = 5,
    TableCreate = 6,
    TableGet = 7,
    TablesGet = 8,
    RowdataInsert = 9,
    RowdataGet = 10,
    TrlogGet = 11,
    TrlogChanged = 12,
    TrlogApply = 13,
    TrlogSync = 14,
    TrlogState = 15,
    TrlogData = 16,
    Select = 17,
    View = 18,
    ViewFetch = 19,
    ViewData = 20,
    Status = 21,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// A broadcast message posted for flood-fill relay to every peer.
    BroadcastPost { msg_id: u16, data: Arc<[u8]> },
    /// A broadcast message received from a peer, carrying the set of node
    /// UUIDs it has already reached.
    Broadcast { msg_id: u16, data: Arc<[u8]>, notified: Arc<[NodeId]> },
    /// A handshake observed a link (connect or disconnect) between two nodes.
    LinkState { from: NodeId, src: NodeId, dst: NodeId, connected: bool },
    /// Notification mirror of a link-connectivity query. The out-param style
    /// `arg`-mutation the original event describes doesn't fit an immutable
    /// `Arc<Event>`; `Tracker::is_connected` answers the query directly as a
    /// plain method call, and this variant exists only so the check can also
    /// be observed by subscribers (tests, diagnostics) the same way every
    /// other tracker transition is.
    LinkCheck { src: NodeId, dst: NodeId, connected: bool },
    /// Request for the current topology snapshot.
    Topology,
    /// A new topology snapshot replaced the previous one.
    TopologyChanged { topology: Arc<Topology> },
    TableCreate { uuid: StorageId },
    TableGet { uuid: StorageId },
    TablesGet,
    RowdataInsert { table: StorageId, count: usize },
    RowdataGet { table: StorageId },
    TrlogGet { trlog: StorageId },
    /// Locally applied records became visible; dependent materialisations
    /// (views) should refresh.
    TrlogChanged { trlog: StorageId },
    TrlogApply { trlog: StorageId, applied_top: u64 },
    TrlogSync { trlog: StorageId, peer: NodeId },
    TrlogState { trlog: StorageId, peer: NodeId, top: u64 },
    TrlogData { trlog: StorageId, peer: NodeId, count: usize },
    Select { table: StorageId },
    View { id: u32 },
    ViewFetch { id: u32, count: usize },
    ViewData { id: u32, rows: usize },
    Status { err: i32 },
}

impl Event {
    pub fn discriminant(&self) -> u32 {
        self.kind() as u32
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::BroadcastPost { .. } => EventKind::BroadcastPost,
            Event::Broadcast { .. } => EventKind::Broadcast,
            Event::LinkState { .. } => EventKind::LinkState,
            Event::LinkCheck { .. } => EventKind::LinkCheck,
            Event::Topology => EventKind::Topology,
            Event::TopologyChanged { .. } => EventKind::TopologyChanged,
            Event::TableCreate { .. } => EventKind::TableCreate,
            Event::TableGet { .. } => EventKind::TableGet,
            Event::TablesGet => EventKind::TablesGet,
            Event::RowdataInsert { .. } => EventKind::RowdataInsert,
            Event::RowdataGet { .. } => EventKind::RowdataGet,
            Event::TrlogGet { .. } => EventKind::TrlogGet,
            Event::TrlogChanged { .. } => EventKind::TrlogChanged,
            Event::TrlogApply { .. } => EventKind::TrlogApply,
            Event::TrlogSync { .. } => EventKind::TrlogSync,
            Event::TrlogState { .. } => EventKind::TrlogState,
            Event::TrlogData { .. } => EventKind::TrlogData,
            Event::Select { .. } => EventKind::Select,
            Event::View { .. } => EventKind::View,
            Event::ViewFetch { .. } => EventKind::ViewFetch,
            Event::ViewData { .. } => EventKind::ViewData,
            Event::Status { .. } => EventKind::Status,
        }
    }

    /// The `(type, identity)` pair `UNIQUE` coalescing hashes on. Identity
    /// is a `u64` the publisher is responsible for choosing meaningfully;
    /// fixing it to a plain `u64` here keeps the bus generic over payload
    /// types without boxing a trait object per publish.
    pub fn identity(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        match self {
            Event::TrlogSync { trlog, peer, .. } => {
                trlog.0.hash(&mut hasher);
                peer.0.hash(&mut hasher);
            }
            Event::LinkState { src, dst, .. } => {
                src.0.hash(&mut hasher);
                dst.0.hash(&mut hasher);
            }
            Event::TrlogChanged { trlog } => trlog.0.hash(&mut hasher),
            _ => self.discriminant().hash(&mut hasher),
        }
        hasher.finish()
    }
}

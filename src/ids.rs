//! Identifier newtypes shared across subsystems.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A cluster-wide unique node identifier. Assigned once, on a node's first
/// start, and persisted in the `metainf` tree thereafter.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub uuid::Uuid);

impl NodeId {
    pub fn generate() -> Self {
        NodeId(uuid::Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// The storage UUID a trlog is keyed by (also a table's identity).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageId(pub uuid::Uuid);

impl StorageId {
    pub fn generate() -> Self {
        StorageId(uuid::Uuid::new_v4())
    }

    /// The well-known id of the tablespace itself: table creation is
    /// replicated as just another trlog, keyed by this reserved nil uuid
    /// instead of a per-table one, so schema changes ride the same
    /// `TrlogSync`/`TrlogState`/`TrlogData` machinery as row data.
    pub const TABLESPACE: StorageId = StorageId(uuid::Uuid::nil());
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageId({})", self.0)
    }
}

/// A node's identity local to the tracker that assigned it: a numeric id
/// unique per local tracker, not shared cluster-wide. Used by the router
/// for its lower-id tie-break.
pub type LocalId = u32;

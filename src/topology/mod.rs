//! Cluster topology: node/link registry, immutable snapshots, routing.

pub mod node;
pub mod router;
pub mod tracker;

pub use node::{Link, Node, Topology};
pub use router::{routes, Routes};
pub use tracker::Tracker;

//! MedvedDB node: a distributed peer-to-peer column-store database core.
//!
//! `config`/`error`/`ids` are shared plumbing; `ebus` is the internal
//! publish/subscribe bus; `topology` tracks cluster membership and routes;
//! `trlog` is the replicated transaction log; `rowset` is the
//! storage-agnostic table/row/view model; `net` is the channel mesh; `wire`
//! is the user/peer protocol built on top of it; `node` wires all of the
//! above into one running process.

pub mod config;
pub mod ebus;
pub mod error;
pub mod ids;
pub mod net;
pub mod node;
pub mod rowset;
pub mod topology;
pub mod trlog;
pub mod wire;

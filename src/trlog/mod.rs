//! Transaction log storage and cross-node catch-up.

pub mod log;
pub mod store;
pub mod synchronizer;

pub use log::{Trlog, TrlogRecord, TrlogRegistry};
pub use store::KvEngine;
pub use synchronizer::{SyncState, Synchronizer, DEFAULT_BATCH_RECORDS};

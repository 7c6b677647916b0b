//! Per-(local, remote, trlog) catch-up state machine.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ids::{NodeId, StorageId};

use super::log::{Trlog, TrlogRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Querying,
    Fetching,
    Applying,
    Cancelled,
}

struct Slot {
    state: SyncState,
    remote_top: u64,
    applied_top: u64,
}

/// Default cap used when the configured batch size isn't known ahead of
/// time: 64 records or 64 KiB, whichever is smaller.
pub const DEFAULT_BATCH_RECORDS: usize = 64;
pub const DEFAULT_BATCH_BYTES: usize = 64 * 1024;

/// Drives the catch-up state machine for every `(remote, trlog)` pair the
/// router currently considers reachable. One `Synchronizer` per local node;
/// callers feed it topology changes and peer replies, and it decides what to
/// send next and how to apply incoming batches.
pub struct Synchronizer {
    slots: Mutex<HashMap<(NodeId, StorageId), Slot>>,
}

impl Synchronizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Synchronizer { slots: Mutex::new(HashMap::new()) })
    }

    pub fn state_of(&self, remote: NodeId, trlog: StorageId) -> Option<SyncState> {
        self.slots.lock().get(&(remote, trlog)).map(|s| s.state)
    }

    /// Seeds (or raises) a slot's `applied_top` to `top` without touching its
    /// state, so a node with a trlog that already has rows on disk (from
    /// before a restart, or from applying earlier batches) doesn't have that
    /// progress mistaken for zero. Must run before `on_peer_reachable`
    /// creates the slot — `on_trlog_data`'s gap check compares an incoming
    /// batch's first `row_id` against this value, and a stale zero here
    /// makes every post-restart batch look like a gap forever.
    pub fn seed(&self, remote: NodeId, trlog: StorageId, top: u64) {
        let mut slots = self.slots.lock();
        let slot = slots.entry((remote, trlog)).or_insert(Slot { state: SyncState::Idle, remote_top: 0, applied_top: 0 });
        slot.applied_top = slot.applied_top.max(top);
    }

    /// `TopologyChanged`: the peer became reachable (or was already) — move
    /// an `Idle`/absent slot to `Querying`. Returns `true` if a `TrlogSync`
    /// request should now be sent.
    pub fn on_peer_reachable(&self, remote: NodeId, trlog: StorageId) -> bool {
        let mut slots = self.slots.lock();
        let slot = slots.entry((remote, trlog)).or_insert(Slot { state: SyncState::Idle, remote_top: 0, applied_top: 0 });
        match slot.state {
            SyncState::Idle | SyncState::Cancelled => {
                slot.state = SyncState::Querying;
                true
            }
            _ => false,
        }
    }

    /// `TopologyChanged`: the peer is no longer reachable — abandon
    /// in-flight work for every trlog shared with it.
    pub fn on_peer_unreachable(&self, remote: NodeId) {
        let mut slots = self.slots.lock();
        for (_, slot) in slots.iter_mut().filter(|((n, _), _)| *n == remote) {
            slot.state = SyncState::Cancelled;
        }
    }

    /// `TrlogState{top}` reply. Returns `true` if the slot needs to issue a
    /// fetch (caller then sends `TrlogSync`'s follow-up fetch request).
    pub fn on_trlog_state(&self, remote: NodeId, trlog: StorageId, top: u64) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&(remote, trlog)) else { return false };
        if slot.state != SyncState::Querying {
            return false;
        }
        slot.remote_top = top;
        if top > slot.applied_top {
            slot.state = SyncState::Fetching;
            true
        } else {
            slot.state = SyncState::Idle;
            false
        }
    }

    /// A `TrlogData` batch arrived. Rejects out-of-order batches (a gap
    /// between `applied_top` and the batch's first id) by requesting a
    /// fresh `TrlogSync` instead of applying. Returns `Ok(true)` if the
    /// batch was applied and the slot should fetch again (still behind),
    /// `Ok(false)` if it caught up, `Err(())` on a gap (caller re-issues
    /// `TrlogSync`).
    pub fn on_trlog_data(&self, remote: NodeId, trlog: &Arc<Trlog>, records: &[TrlogRecord]) -> Result<bool, ()> {
        let key = (remote, trlog.uuid());
        {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&key) else { return Err(()) };
            if slot.state != SyncState::Fetching {
                return Err(());
            }
            slot.state = SyncState::Applying;
        }

        if let Some(first) = records.first() {
            let applied_top = self.slots.lock().get(&key).map(|s| s.applied_top).unwrap_or(0);
            if first.row_id > applied_top + 1 {
                let mut slots = self.slots.lock();
                if let Some(slot) = slots.get_mut(&key) {
                    slot.state = SyncState::Querying;
                }
                return Err(());
            }
        }

        if trlog.append(records).is_err() {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(&key) {
                slot.state = SyncState::Querying;
            }
            return Err(());
        }

        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&key) else { return Err(()) };
        slot.applied_top = trlog.top();
        if slot.applied_top < slot.remote_top {
            slot.state = SyncState::Fetching;
            Ok(true)
        } else {
            slot.state = SyncState::Idle;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trlog::TrlogRegistry;

    fn trlog() -> Arc<Trlog> {
        let dir = tempfile::tempdir().unwrap();
        let reg = TrlogRegistry::new(sled::open(dir.path()).unwrap());
        reg.open(StorageId::generate()).unwrap()
    }

    #[test]
    fn happy_path_idle_to_querying_to_fetching_to_idle() {
        let sync = Synchronizer::new();
        let remote = NodeId::generate();
        let log = trlog();

        assert!(sync.on_peer_reachable(remote, log.uuid()));
        assert_eq!(sync.state_of(remote, log.uuid()), Some(SyncState::Querying));

        assert!(sync.on_trlog_state(remote, log.uuid(), 2));
        assert_eq!(sync.state_of(remote, log.uuid()), Some(SyncState::Fetching));

        let caught_up = sync
            .on_trlog_data(remote, &log, &[TrlogRecord { row_id: 1, op: vec![] }, TrlogRecord { row_id: 2, op: vec![] }])
            .unwrap();
        assert!(!caught_up);
        assert_eq!(sync.state_of(remote, log.uuid()), Some(SyncState::Idle));
    }

    #[test]
    fn remote_already_caught_up_goes_straight_to_idle() {
        let sync = Synchronizer::new();
        let remote = NodeId::generate();
        let log = trlog();
        sync.on_peer_reachable(remote, log.uuid());
        assert!(!sync.on_trlog_state(remote, log.uuid(), 0));
        assert_eq!(sync.state_of(remote, log.uuid()), Some(SyncState::Idle));
    }

    #[test]
    fn peer_unreachable_cancels_in_flight_slot() {
        let sync = Synchronizer::new();
        let remote = NodeId::generate();
        let log = trlog();
        sync.on_peer_reachable(remote, log.uuid());
        sync.on_trlog_state(remote, log.uuid(), 5);
        sync.on_peer_unreachable(remote);
        assert_eq!(sync.state_of(remote, log.uuid()), Some(SyncState::Cancelled));
    }

    #[test]
    fn seed_before_reachable_avoids_false_gap_after_restart() {
        let sync = Synchronizer::new();
        let remote = NodeId::generate();
        let log = trlog();

        // The local trlog already has 50 applied rows from before a restart.
        log.reserve(50);
        log.append(&(1..=50).map(|i| TrlogRecord { row_id: i, op: vec![] }).collect::<Vec<_>>()).unwrap();

        sync.seed(remote, log.uuid(), log.top());
        assert!(sync.on_peer_reachable(remote, log.uuid()));
        assert!(sync.on_trlog_state(remote, log.uuid(), 60));

        // The remote's first post-restart batch starts right after our seeded
        // `applied_top`, not after a stale zero.
        let batch: Vec<TrlogRecord> = (51..=55).map(|i| TrlogRecord { row_id: i, op: vec![] }).collect();
        let still_behind = sync.on_trlog_data(remote, &log, &batch).unwrap();
        assert!(still_behind);
        assert_eq!(sync.state_of(remote, log.uuid()), Some(SyncState::Fetching));
    }

    #[test]
    fn without_seed_a_restart_looks_like_a_permanent_gap() {
        let sync = Synchronizer::new();
        let remote = NodeId::generate();
        let log = trlog();
        log.reserve(50);
        log.append(&(1..=50).map(|i| TrlogRecord { row_id: i, op: vec![] }).collect::<Vec<_>>()).unwrap();

        // No seed(): the slot starts at applied_top 0 even though the trlog
        // itself is already at 50.
        sync.on_peer_reachable(remote, log.uuid());
        sync.on_trlog_state(remote, log.uuid(), 60);

        let batch: Vec<TrlogRecord> = (51..=55).map(|i| TrlogRecord { row_id: i, op: vec![] }).collect();
        let res = sync.on_trlog_data(remote, &log, &batch);
        assert!(res.is_err(), "unseeded slot misreads row 51 as a gap past applied_top 0");
    }

    #[test]
    fn gap_in_batch_reissues_sync() {
        let sync = Synchronizer::new();
        let remote = NodeId::generate();
        let log = trlog();
        sync.on_peer_reachable(remote, log.uuid());
        sync.on_trlog_state(remote, log.uuid(), 5);
        let res = sync.on_trlog_data(remote, &log, &[TrlogRecord { row_id: 3, op: vec![] }]);
        assert!(res.is_err());
        assert_eq!(sync.state_of(remote, log.uuid()), Some(SyncState::Querying));
    }
}

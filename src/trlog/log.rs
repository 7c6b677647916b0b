//! Per-storage-UUID transaction log.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MdvError, MdvResult};
use crate::ids::StorageId;

use super::store::KvEngine;

/// One appended entry. `row_id` is strictly monotonic within its trlog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrlogRecord {
    pub row_id: u64,
    pub op: Vec<u8>,
}

/// An append-only ordered record log keyed by a storage UUID, backed by a
/// [`KvEngine`]. Row ids are big-endian encoded as the sled key so range
/// scans come back in `row_id` order for free.
pub struct Trlog {
    uuid: StorageId,
    engine: Box<dyn KvEngine>,
    write_lock: Mutex<u64>,
}

impl Trlog {
    fn open(uuid: StorageId, engine: Box<dyn KvEngine>) -> MdvResult<Self> {
        let top = Self::scan_top(&*engine)?;
        Ok(Trlog { uuid, engine, write_lock: Mutex::new(top) })
    }

    fn scan_top(engine: &dyn KvEngine) -> MdvResult<u64> {
        let rows = engine.range(&0u64.to_be_bytes(), None)?;
        Ok(rows.last().map(|(k, _)| u64::from_be_bytes(k[..8].try_into().unwrap())).unwrap_or(0))
    }

    pub fn uuid(&self) -> StorageId {
        self.uuid
    }

    /// The highest `row_id` present, or 0 if empty.
    pub fn top(&self) -> u64 {
        *self.write_lock.lock()
    }

    /// Reserve `n` contiguous ids under the writer lock, returning the
    /// first. Callers append records with ids `[first_id, first_id + n)`.
    pub fn reserve(&self, n: u64) -> u64 {
        let mut top = self.write_lock.lock();
        let first = *top + 1;
        *top += n;
        first
    }

    /// Append a batch, already carrying ids reserved with [`Trlog::reserve`]
    /// or received from a peer. Records with `row_id <= top()` before this
    /// call are silently skipped, making reapply idempotent.
    pub fn append(&self, records: &[TrlogRecord]) -> MdvResult<()> {
        let mut top = self.write_lock.lock();
        for r in records {
            if r.row_id <= *top {
                // Already applied; a resent batch after a restart replays
                // ids the trlog has already seen.
                continue;
            }
            self.engine.put(&r.row_id.to_be_bytes(), &r.op)?;
            *top = r.row_id;
        }
        self.engine.flush()
    }

    /// Records with `row_id > from_exclusive`, in ascending order, capped at
    /// `max_count`.
    pub fn range(&self, from_exclusive: u64, max_count: usize) -> MdvResult<Vec<TrlogRecord>> {
        let lower = from_exclusive.saturating_add(1).to_be_bytes();
        let rows = self.engine.range(&lower, None)?;
        Ok(rows
            .into_iter()
            .take(max_count)
            .map(|(k, v)| TrlogRecord { row_id: u64::from_be_bytes(k[..8].try_into().unwrap()), op: v })
            .collect())
    }
}

/// Opens trlogs by UUID idempotently: a second `open` for the same UUID
/// while a live `Arc<Trlog>` still exists returns a clone of it rather than
/// a fresh instance. The registry holds only `Weak` references, so a trlog
/// actually closes (its `sled::Tree` handle drops) once the last `Arc`
/// owner releases it, the same refcount-to-zero-runs-destructor-once
/// lifecycle `Channel` and `Topology` follow.
pub struct TrlogRegistry {
    db: sled::Db,
    open: Mutex<HashMap<StorageId, Weak<Trlog>>>,
}

impl TrlogRegistry {
    pub fn new(db: sled::Db) -> Arc<Self> {
        Arc::new(TrlogRegistry { db, open: Mutex::new(HashMap::new()) })
    }

    pub fn open(&self, uuid: StorageId) -> MdvResult<Arc<Trlog>> {
        let mut open = self.open.lock();
        if let Some(existing) = open.get(&uuid).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let tree_name = format!("trlog/{uuid}");
        let engine = crate::trlog::store::SledEngine::open(&self.db, &tree_name)
            .map_err(|_| MdvError::Failed(format!("can't open trlog {uuid}")))?;
        let trlog = Arc::new(Trlog::open(uuid, Box::new(engine))?);
        open.insert(uuid, Arc::downgrade(&trlog));
        Ok(trlog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<TrlogRegistry> {
        let dir = tempfile::tempdir().unwrap();
        TrlogRegistry::new(sled::open(dir.path()).unwrap())
    }

    #[test]
    fn reserve_and_append_advance_top() {
        let reg = registry();
        let uuid = StorageId::generate();
        let log = reg.open(uuid).unwrap();
        assert_eq!(log.top(), 0);

        let first = log.reserve(3);
        assert_eq!(first, 1);
        log.append(&[
            TrlogRecord { row_id: 1, op: vec![1] },
            TrlogRecord { row_id: 2, op: vec![2] },
            TrlogRecord { row_id: 3, op: vec![3] },
        ])
        .unwrap();
        assert_eq!(log.top(), 3);
    }

    #[test]
    fn range_is_ordered_and_bounded() {
        let reg = registry();
        let log = reg.open(StorageId::generate()).unwrap();
        log.reserve(5);
        log.append(&(1..=5).map(|i| TrlogRecord { row_id: i, op: vec![i as u8] }).collect::<Vec<_>>()).unwrap();

        let got = log.range(2, 2).unwrap();
        assert_eq!(got.iter().map(|r| r.row_id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn open_is_idempotent_while_referenced() {
        let reg = registry();
        let uuid = StorageId::generate();
        let a = reg.open(uuid).unwrap();
        let b = reg.open(uuid).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reopen_after_drop_is_a_fresh_instance() {
        let reg = registry();
        let uuid = StorageId::generate();
        let a = reg.open(uuid).unwrap();
        a.reserve(1);
        a.append(&[TrlogRecord { row_id: 1, op: vec![9] }]).unwrap();
        drop(a);

        let b = reg.open(uuid).unwrap();
        // Persisted state survives even though the in-memory instance didn't.
        assert_eq!(b.top(), 1);
    }
}

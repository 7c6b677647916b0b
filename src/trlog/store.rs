//! The embedded key/value engine contract, treating the storage engine as
//! an external collaborator, and its `sled` realization.

use crate::error::MdvResult;

/// What a trlog needs from its backing store: ordered byte-key iteration,
/// point get/put, and an explicit flush. Any engine with sorted iteration
/// over its keyspace can implement this; `sled` is the one actually wired
/// up.
pub trait KvEngine: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> MdvResult<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> MdvResult<()>;
    /// Keys in `[from, to)` (`to` exclusive when `Some`), in ascending order.
    fn range(&self, from: &[u8], to: Option<&[u8]>) -> MdvResult<Vec<(Vec<u8>, Vec<u8>)>>;
    fn flush(&self) -> MdvResult<()>;
}

/// A `sled::Tree` wrapped behind [`KvEngine`].
pub struct SledEngine {
    tree: sled::Tree,
}

impl SledEngine {
    pub fn open(db: &sled::Db, name: &str) -> MdvResult<Self> {
        Ok(SledEngine { tree: db.open_tree(name)? })
    }
}

impl KvEngine for SledEngine {
    fn get(&self, key: &[u8]) -> MdvResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> MdvResult<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn range(&self, from: &[u8], to: Option<&[u8]>) -> MdvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> = match to {
            Some(to) => Box::new(self.tree.range(from.to_vec()..to.to_vec())),
            None => Box::new(self.tree.range(from.to_vec()..)),
        };
        let mut out = Vec::new();
        for item in iter {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn flush(&self) -> MdvResult<()> {
        self.tree.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let engine = SledEngine::open(&db, "t").unwrap();
        engine.put(b"k1", b"v1").unwrap();
        assert_eq!(engine.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(engine.get(b"missing").unwrap(), None);
    }

    #[test]
    fn range_is_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let engine = SledEngine::open(&db, "t").unwrap();
        for i in 0u64..5 {
            engine.put(&i.to_be_bytes(), b"x").unwrap();
        }
        let got = engine.range(&0u64.to_be_bytes(), None).unwrap();
        let keys: Vec<u64> = got.iter().map(|(k, _)| u64::from_be_bytes(k[..8].try_into().unwrap())).collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 4]);
    }
}

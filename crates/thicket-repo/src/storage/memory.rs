//! In-memory block storage implementation

use crate::error::Result;
use crate::storage::BlockStore;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thicket_common::IpldCid;

/// In-memory block storage using BTreeMap
///
/// Useful for:
/// - Testing
/// - Loading a CAR file for walking or verification
/// - Small repositories that fit in memory
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<BTreeMap<IpldCid, Bytes>>>,
}

impl MemoryBlockStore {
    /// Create new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create new memory store from a map of blocks
    pub fn new_from_blocks(blocks: BTreeMap<IpldCid, Bytes>) -> Self {
        Self {
            blocks: Arc::new(RwLock::new(blocks)),
        }
    }

    // poisoning is ignored: every write is a single map operation
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<IpldCid, Bytes>> {
        self.blocks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<IpldCid, Bytes>> {
        self.blocks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get number of blocks stored
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Clear all blocks
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Remove a block, returning it if present
    pub fn remove(&self, cid: &IpldCid) -> Option<Bytes> {
        self.write().remove(cid)
    }

    /// All stored CIDs, in CID byte order
    pub fn cids(&self) -> Vec<IpldCid> {
        self.read().keys().copied().collect()
    }
}

impl BlockStore for MemoryBlockStore {
    fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        Ok(self.read().get(cid).cloned())
    }

    fn put(&self, cid: IpldCid, data: Bytes) -> Result<()> {
        self.write().insert(cid, data);
        Ok(())
    }

    fn has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self.read().contains_key(cid))
    }

    fn put_many(&self, blocks: impl IntoIterator<Item = (IpldCid, Bytes)>) -> Result<()> {
        let mut store = self.write();
        for (cid, data) in blocks {
            store.insert(cid, data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepoErrorKind;
    use thicket_common::compute_cid;

    #[test]
    fn test_put_and_get() {
        let store = MemoryBlockStore::new();
        let data = b"test data";

        let cid = store.put_bytes(data).unwrap();
        let retrieved = store.get(&cid).unwrap();

        assert_eq!(retrieved.as_deref(), Some(&data[..]));
        assert_eq!(cid, compute_cid(data).unwrap());
    }

    #[test]
    fn test_has() {
        let store = MemoryBlockStore::new();
        let cid = store.put_bytes(b"test data").unwrap();
        assert!(store.has(&cid).unwrap());

        let other = compute_cid(b"other").unwrap();
        assert!(!store.has(&other).unwrap());
    }

    #[test]
    fn test_put_many() {
        let store = MemoryBlockStore::new();

        let data1 = b"data1";
        let data2 = b"data2";
        let cid1 = compute_cid(data1).unwrap();
        let cid2 = compute_cid(data2).unwrap();

        store
            .put_many(vec![
                (cid1, Bytes::from_static(data1)),
                (cid2, Bytes::from_static(data2)),
            ])
            .unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.has(&cid1).unwrap());
        assert!(store.has(&cid2).unwrap());
    }

    #[test]
    fn test_get_required_missing() {
        let store = MemoryBlockStore::new();
        let cid = compute_cid(b"absent").unwrap();
        let err = store.get_required(&cid).unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::NotFound);
    }

    #[test]
    fn test_remove_and_clear() {
        let store = MemoryBlockStore::new();
        let cid = store.put_bytes(b"data").unwrap();
        store.put_bytes(b"more").unwrap();

        assert_eq!(store.remove(&cid).as_deref(), Some(&b"data"[..]));
        assert_eq!(store.len(), 1);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_clone_shares_storage() {
        let store1 = MemoryBlockStore::new();
        let store2 = store1.clone();

        let cid = store1.put_bytes(b"test").unwrap();
        assert!(store2.has(&cid).unwrap());
    }
}

//! Block storage abstraction for MST nodes, commits and records

use crate::error::{RepoError, Result};
use bytes::Bytes;
use thicket_common::{IpldCid, compute_cid};

/// CID-keyed block storage
///
/// The store is an arena: MST nodes refer to each other only through CIDs, and
/// every lookup goes through this trait. Implementations use interior locking
/// so a store can be shared behind an `Arc` between tree handles.
///
/// `put` trusts the CID it is given. Blocks from untrusted sources should be
/// checked with [`thicket_common::verify_cid`] first (the CAR loader does
/// this).
///
/// # Example
///
/// ```
/// use thicket_repo::storage::{BlockStore, MemoryBlockStore};
///
/// let storage = MemoryBlockStore::new();
/// let cid = storage.put_bytes(b"hello world").unwrap();
/// assert_eq!(storage.get(&cid).unwrap().as_deref(), Some(&b"hello world"[..]));
/// ```
pub trait BlockStore: Send + Sync {
    /// Get a block by CID
    ///
    /// Returns `None` if the block is not found.
    fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>>;

    /// Store a block under a CID the caller already computed
    fn put(&self, cid: IpldCid, data: Bytes) -> Result<()>;

    /// Check if a block exists without retrieving it
    fn has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self.get(cid)?.is_some())
    }

    /// Put many blocks at once
    ///
    /// A simple implementation can just call `put()` individually.
    fn put_many(&self, blocks: impl IntoIterator<Item = (IpldCid, Bytes)>) -> Result<()>
    where
        Self: Sized,
    {
        for (cid, data) in blocks {
            self.put(cid, data)?;
        }
        Ok(())
    }

    /// Hash canonical bytes, store them, and return their CID
    fn put_bytes(&self, data: &[u8]) -> Result<IpldCid> {
        let cid = compute_cid(data)?;
        self.put(cid, Bytes::copy_from_slice(data))?;
        Ok(cid)
    }

    /// Get a block that must exist
    fn get_required(&self, cid: &IpldCid) -> Result<Bytes> {
        self.get(cid)?
            .ok_or_else(|| RepoError::not_found("block", cid))
    }
}

pub mod memory;

pub use memory::MemoryBlockStore;

//! High-level repository operations
//!
//! Convenience layer over the MST and commit primitives: record reads,
//! batch writes that produce a signed commit, and CAR import/export.

use crate::car::{Block, CarHeader, CarOptions, CarWriter, load_car_into_with, write_car};
use crate::commit::{Commit, Revision, Signer, UnsignedCommit, Verifier, check_rev};
use crate::error::{RepoError, Result};
use crate::mst::{Mst, TreeStats, WriteOp};
use crate::storage::BlockStore;
use bytes::Bytes;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use thicket_common::{IpldCid, Value, decode};

/// A record-level write for [`Repository::apply_writes`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordWrite {
    /// Create new record (error if exists)
    Create {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Record contents
        record: Value,
    },

    /// Replace an existing record (error if not exists)
    Update {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// New record contents
        record: Value,
        /// Expected current CID, checked when present
        prev: Option<IpldCid>,
    },

    /// Delete an existing record (error if not exists)
    Delete {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Expected current CID, checked when present
        prev: Option<IpldCid>,
    },
}

impl RecordWrite {
    /// Key this write touches
    pub fn key(&self) -> &str {
        match self {
            RecordWrite::Create { key, .. }
            | RecordWrite::Update { key, .. }
            | RecordWrite::Delete { key, .. } => key.as_str(),
        }
    }
}

/// Commit data for repository updates
///
/// Everything a sync consumer needs to follow the repository from the
/// previous commit to this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitData {
    /// Commit CID
    pub cid: IpldCid,

    /// New revision
    pub rev: Revision,

    /// Previous revision (None for initial commit)
    pub since: Option<Revision>,

    /// Previous commit CID (None for initial commit)
    pub prev: Option<IpldCid>,

    /// New MST root CID
    pub data: IpldCid,

    /// Previous MST root CID
    pub prev_data: Option<IpldCid>,

    /// Newly written blocks: MST nodes, record data and the commit block
    pub blocks: BTreeMap<IpldCid, Bytes>,

    /// MST nodes no longer reachable from the new root
    pub removed_nodes: Vec<IpldCid>,
}

/// A repository: the current signed commit and the tree it points to
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use thicket_common::Value;
/// use thicket_repo::commit::Revision;
/// use thicket_repo::repo::{RecordWrite, Repository};
/// use thicket_repo::storage::MemoryBlockStore;
///
/// let key = k256::ecdsa::SigningKey::from_slice(&[1u8; 32]).unwrap();
/// let storage = Arc::new(MemoryBlockStore::new());
/// let mut repo =
///     Repository::create(storage, "did:plc:example", Revision::new("3jzfcijpj2z2a"), &key).unwrap();
///
/// let post = Value::map([("$type", Value::text("app.bsky.feed.post")), ("text", Value::text("hi"))]);
/// let commit = repo
///     .apply_writes(
///         &[RecordWrite::Create { key: "app.bsky.feed.post/3jzfcijpj2z2b".into(), record: post.clone() }],
///         Revision::new("3jzfcijpj2z2b"),
///         &key,
///     )
///     .unwrap();
///
/// assert_eq!(repo.commit_cid(), &commit.cid);
/// assert_eq!(repo.get_record("app.bsky.feed.post/3jzfcijpj2z2b").unwrap(), Some(post));
/// ```
pub struct Repository<S: BlockStore> {
    mst: Mst<S>,
    storage: Arc<S>,
    commit: Commit,
    commit_cid: IpldCid,
}

impl<S: BlockStore> Repository<S> {
    /// Create repository from existing components
    pub fn new(storage: Arc<S>, mst: Mst<S>, commit: Commit, commit_cid: IpldCid) -> Self {
        Self {
            storage,
            mst,
            commit,
            commit_cid,
        }
    }

    /// Start a new, empty repository with a signed initial commit
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(rev = %rev)))]
    pub fn create(
        storage: Arc<S>,
        did: impl AsRef<str>,
        rev: Revision,
        signer: &impl Signer,
    ) -> Result<Self> {
        let mst = Mst::empty(storage.clone())?;
        let commit = UnsignedCommit::new(mst.root(), rev, None)
            .with_did(did.as_ref())
            .sign(signer)?;
        let block = commit.to_block()?;
        storage.put(block.cid, block.data)?;

        Ok(Self {
            mst,
            storage,
            commit,
            commit_cid: block.cid,
        })
    }

    /// Load repository from commit CID
    pub fn load(storage: Arc<S>, commit_cid: &IpldCid) -> Result<Self> {
        let commit_bytes = storage.get(commit_cid)?.ok_or_else(|| {
            RepoError::not_found("commit", commit_cid)
                .with_help("the commit block must be in storage before the repository is loaded")
        })?;
        let commit = Commit::from_bytes(&commit_bytes)?;
        let mst = Mst::load(storage.clone(), commit.data);

        Ok(Self {
            mst,
            storage,
            commit,
            commit_cid: *commit_cid,
        })
    }

    /// Import a container into storage and load the repository at its first
    /// root. Every block's CID is checked on the way in.
    pub fn from_car(storage: Arc<S>, reader: impl Read) -> Result<Self> {
        Self::from_car_with(storage, reader, CarOptions::default())
    }

    /// [`Repository::from_car`] with explicit container options
    pub fn from_car_with(storage: Arc<S>, reader: impl Read, options: CarOptions) -> Result<Self> {
        let header = load_car_into_with(&*storage, reader, options)?;
        let root = header
            .roots
            .first()
            .ok_or_else(|| RepoError::invalid_commit("container has no root"))?;
        Self::load(storage, root)
    }

    /// Get a record's CID by key
    pub fn get_record_cid(&self, key: &str) -> Result<Option<IpldCid>> {
        self.mst.get(key)
    }

    /// Get and decode a record by key
    ///
    /// A key present in the tree whose record block is missing is
    /// `NotFound`.
    pub fn get_record(&self, key: &str) -> Result<Option<Value>> {
        let Some(cid) = self.mst.get(key)? else {
            return Ok(None);
        };
        let data = self
            .storage
            .get(&cid)?
            .ok_or_else(|| RepoError::not_found("record block", format!("{} (key {})", cid, key)))?;
        Ok(Some(decode(&data)?))
    }

    /// Store a record block without touching the tree, returning its CID
    pub fn put_record(&self, record: &Value) -> Result<IpldCid> {
        let block = Block::encode(record)?;
        self.storage.put(block.cid, block.data)?;
        Ok(block.cid)
    }

    /// Apply a batch of record writes and sign the result as the next commit
    ///
    /// The batch is atomic: if any write fails (an existing key on create, a
    /// missing key, a `prev` mismatch, a signing failure) the repository and
    /// its storage are left unchanged. A revision older than the current one
    /// is an `Order` error.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(ops = writes.len(), rev = %rev)))]
    pub fn apply_writes(
        &mut self,
        writes: &[RecordWrite],
        rev: Revision,
        signer: &impl Signer,
    ) -> Result<CommitData> {
        check_rev(&self.commit.rev, &rev)?;

        let mut record_blocks = BTreeMap::new();
        let ops = writes
            .iter()
            .map(|write| -> Result<WriteOp> {
                Ok(match write {
                    RecordWrite::Create { key, record } => {
                        let block = Block::encode(record)?;
                        let cid = block.cid;
                        record_blocks.insert(block.cid, block.data);
                        WriteOp::Create {
                            key: key.clone(),
                            cid,
                        }
                    }
                    RecordWrite::Update { key, record, prev } => {
                        let block = Block::encode(record)?;
                        let cid = block.cid;
                        record_blocks.insert(block.cid, block.data);
                        WriteOp::Update {
                            key: key.clone(),
                            cid,
                            prev: *prev,
                        }
                    }
                    RecordWrite::Delete { key, prev } => WriteOp::Delete {
                        key: key.clone(),
                        prev: *prev,
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let (root, node_blocks) = self.mst.stage_ops(&ops)?;
        let commit = UnsignedCommit::successor(&self.commit, self.commit_cid, root, rev)?
            .sign(signer)?;
        let commit_block = commit.to_block()?;

        // nothing is stored until the commit is signed
        let mut blocks = record_blocks;
        blocks.extend(node_blocks.into_iter().map(<(IpldCid, Bytes)>::from));
        blocks.insert(commit_block.cid, commit_block.data);
        self.storage.put_many(blocks.clone())?;

        let updated = Mst::load(self.storage.clone(), root);
        let removed_nodes = self.mst.diff(&updated)?.removed_nodes;

        let data = CommitData {
            cid: commit_block.cid,
            rev: commit.rev.clone(),
            since: Some(self.commit.rev.clone()),
            prev: Some(self.commit_cid),
            data: updated.root(),
            prev_data: Some(self.commit.data),
            blocks,
            removed_nodes,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(commit = %data.cid, blocks = data.blocks.len(), "applied writes");

        self.mst = updated;
        self.commit = commit;
        self.commit_cid = data.cid;
        Ok(data)
    }

    /// Check the commit signature and the whole tree
    pub fn verify(&self, verifier: &impl Verifier) -> Result<TreeStats> {
        self.commit.verify(verifier)?;
        self.mst.verify()
    }

    /// Write the repository as a container rooted at the current commit:
    /// the commit block, then the tree in export order.
    pub fn export_car<W: Write>(&self, writer: W) -> Result<W> {
        self.export_car_with(writer, CarOptions::default())
    }

    /// [`Repository::export_car`] with explicit container options
    pub fn export_car_with<W: Write>(&self, writer: W, options: CarOptions) -> Result<W> {
        let header = CarHeader::new(vec![self.commit_cid]);
        let mut car = CarWriter::with_options(writer, header, options)?;
        car.write_block(&self.commit_cid, &self.commit.to_bytes())?;
        self.mst.write_blocks(&mut car)?;
        car.finish()
    }

    /// Write the repository to a container file
    pub async fn export_car_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut blocks = vec![(self.commit_cid, Bytes::from(self.commit.to_bytes()))];
        blocks.extend(self.mst.collect_blocks()?);
        write_car(path, vec![self.commit_cid], blocks).await
    }

    /// Get the underlying MST
    pub fn mst(&self) -> &Mst<S> {
        &self.mst
    }

    /// Get reference to the storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Get the current commit
    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    /// Get the current commit CID
    pub fn commit_cid(&self) -> &IpldCid {
        &self.commit_cid
    }

    /// Get the current revision
    pub fn rev(&self) -> &Revision {
        &self.commit.rev
    }

    /// Get the DID from the current commit
    pub fn did(&self) -> Option<&str> {
        self.commit.did()
    }
}

impl<S: BlockStore> Display for Repository<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Repository {{")?;
        writeln!(f, "  DID: {}", self.commit.did().unwrap_or("-"))?;
        writeln!(f, "  Commit: {}", self.commit_cid)?;
        writeln!(f, "  Rev: {}", self.commit.rev)?;
        writeln!(f, "  Data: {}", self.commit.data)?;
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::SectionFraming;
    use crate::commit::FnSigner;
    use crate::error::RepoErrorKind;
    use crate::storage::MemoryBlockStore;

    fn key() -> k256::ecdsa::SigningKey {
        k256::ecdsa::SigningKey::from_slice(&[5u8; 32]).unwrap()
    }

    fn post(n: u64) -> Value {
        Value::map([
            ("$type", Value::text("app.bsky.feed.post")),
            ("text", Value::text(format!("Test post #{}", n))),
            ("createdAt", Value::text("2024-01-01T00:00:00Z")),
        ])
    }

    fn create(key: &str, n: u64) -> RecordWrite {
        RecordWrite::Create {
            key: key.into(),
            record: post(n),
        }
    }

    fn new_repo() -> Repository<MemoryBlockStore> {
        let storage = Arc::new(MemoryBlockStore::new());
        Repository::create(storage, "did:plc:test", Revision::new("3jzfcijpj2z2a"), &key()).unwrap()
    }

    #[test]
    fn create_and_get_record() {
        let mut repo = new_repo();
        assert_eq!(repo.did(), Some("did:plc:test"));

        let data = repo
            .apply_writes(
                &[create("app.bsky.feed.post/3jzfcijpj2z2b", 1)],
                Revision::new("3jzfcijpj2z2b"),
                &key(),
            )
            .unwrap();

        assert_eq!(
            repo.get_record("app.bsky.feed.post/3jzfcijpj2z2b").unwrap(),
            Some(post(1))
        );
        assert_eq!(repo.get_record("app.bsky.feed.post/nope").unwrap(), None);
        assert_eq!(data.since, Some(Revision::new("3jzfcijpj2z2a")));
        assert!(data.blocks.contains_key(&data.cid));
        assert!(data.blocks.contains_key(&data.data));
        assert_eq!(repo.rev().as_str(), "3jzfcijpj2z2b");
        repo.verify(key().verifying_key()).unwrap();
    }

    #[test]
    fn commit_chain_links_back() {
        let mut repo = new_repo();
        let first = *repo.commit_cid();
        let c1 = repo
            .apply_writes(&[create("a/1", 1)], Revision::new("3jzfcijpj2z2b"), &key())
            .unwrap();
        assert_eq!(c1.prev, Some(first));
        let prev = repo.get_record_cid("a/1").unwrap();
        let c2 = repo
            .apply_writes(
                &[RecordWrite::Update {
                    key: "a/1".into(),
                    record: post(2),
                    prev,
                }],
                Revision::new("3jzfcijpj2z2c"),
                &key(),
            )
            .unwrap();
        assert_eq!(c2.prev, Some(c1.cid));
        assert_eq!(c2.prev_data, Some(c1.data));
        assert_eq!(repo.get_record("a/1").unwrap(), Some(post(2)));

        let reloaded = Repository::load(repo.storage().clone(), &c2.cid).unwrap();
        assert_eq!(reloaded.commit(), repo.commit());
        assert_eq!(reloaded.mst().root(), c2.data);
    }

    #[test]
    fn older_revision_rejected_before_writing() {
        let mut repo = new_repo();
        let before = repo.storage().len();
        let err = repo
            .apply_writes(&[create("a/1", 1)], Revision::new("2222222222222"), &key())
            .unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::Order);
        assert_eq!(repo.storage().len(), before);
        assert_eq!(repo.rev().as_str(), "3jzfcijpj2z2a");
    }

    #[test]
    fn failed_batch_leaves_repo_unchanged() {
        let mut repo = new_repo();
        repo.apply_writes(&[create("a/1", 1)], Revision::new("3jzfcijpj2z2b"), &key())
            .unwrap();
        let commit_cid = *repo.commit_cid();

        let err = repo
            .apply_writes(
                &[create("a/2", 2), create("a/1", 3)],
                Revision::new("3jzfcijpj2z2c"),
                &key(),
            )
            .unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::Conflict);
        assert_eq!(repo.commit_cid(), &commit_cid);
        assert_eq!(repo.get_record_cid("a/2").unwrap(), None);

        let err = repo
            .apply_writes(
                &[RecordWrite::Delete {
                    key: "b/1".into(),
                    prev: None,
                }],
                Revision::new("3jzfcijpj2z2c"),
                &key(),
            )
            .unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::NotFound);
    }

    #[test]
    fn delete_reports_removed_nodes() {
        let mut repo = new_repo();
        let added = repo
            .apply_writes(&[create("a/1", 1)], Revision::new("3jzfcijpj2z2b"), &key())
            .unwrap();
        let removed = repo
            .apply_writes(
                &[RecordWrite::Delete {
                    key: "a/1".into(),
                    prev: None,
                }],
                Revision::new("3jzfcijpj2z2c"),
                &key(),
            )
            .unwrap();
        assert!(removed.removed_nodes.contains(&added.data));
        assert!(repo.mst().leaves().unwrap().is_empty());
    }

    #[test]
    fn car_export_and_import() {
        let mut repo = new_repo();
        repo.apply_writes(
            &[create("a/1", 1), create("a/2", 2), create("b/1", 3)],
            Revision::new("3jzfcijpj2z2b"),
            &key(),
        )
        .unwrap();

        let car = repo.export_car(Vec::new()).unwrap();
        let imported = Repository::from_car(Arc::new(MemoryBlockStore::new()), &car[..]).unwrap();

        assert_eq!(imported.commit_cid(), repo.commit_cid());
        assert_eq!(imported.mst().leaves().unwrap(), repo.mst().leaves().unwrap());
        assert_eq!(imported.get_record("b/1").unwrap(), Some(post(3)));
        imported.verify(key().verifying_key()).unwrap();
    }

    #[test]
    fn signing_failure_stores_nothing() {
        let mut repo = new_repo();
        let before = repo.storage().len();
        let commit_cid = *repo.commit_cid();

        let failing = FnSigner(|_: &[u8]| -> std::result::Result<Vec<u8>, std::io::Error> {
            Err(std::io::Error::other("key unavailable"))
        });
        let err = repo
            .apply_writes(
                &[create("a/1", 1), create("b/1", 2)],
                Revision::new("3jzfcijpj2z2b"),
                &failing,
            )
            .unwrap_err();

        assert_eq!(*err.kind(), RepoErrorKind::Crypto);
        assert_eq!(repo.storage().len(), before);
        assert_eq!(repo.commit_cid(), &commit_cid);
        assert_eq!(repo.get_record_cid("a/1").unwrap(), None);
    }

    #[test]
    fn split_framed_export_and_import() {
        let mut repo = new_repo();
        repo.apply_writes(
            &[create("a/1", 1), create("a/2", 2)],
            Revision::new("3jzfcijpj2z2b"),
            &key(),
        )
        .unwrap();

        let split = CarOptions::new().framing(SectionFraming::Split).build();
        let car = repo.export_car_with(Vec::new(), split.clone()).unwrap();
        assert_ne!(car, repo.export_car(Vec::new()).unwrap());

        // first section: {cid len}{cid}{block len}{commit block}
        let header_len = car[0] as usize;
        let section = &car[1 + header_len..];
        let cid_bytes = repo.commit_cid().to_bytes();
        let commit_bytes = repo.commit().to_bytes();
        assert_eq!(section[0] as usize, cid_bytes.len());
        assert_eq!(&section[1..1 + cid_bytes.len()], &cid_bytes[..]);
        let rest = &section[1 + cid_bytes.len()..];
        let (block_len, used) = thicket_common::varint::decode_uvarint(rest).unwrap();
        assert_eq!(block_len as usize, commit_bytes.len());
        assert_eq!(&rest[used..used + commit_bytes.len()], &commit_bytes[..]);

        let imported =
            Repository::from_car_with(Arc::new(MemoryBlockStore::new()), &car[..], split).unwrap();
        assert_eq!(imported.commit_cid(), repo.commit_cid());
        assert_eq!(imported.get_record("a/2").unwrap(), Some(post(2)));
        imported.verify(key().verifying_key()).unwrap();

        // the default reader does not accept split sections
        assert!(Repository::from_car(Arc::new(MemoryBlockStore::new()), &car[..]).is_err());
    }

    #[test]
    fn load_missing_commit() {
        let storage = Arc::new(MemoryBlockStore::new());
        let cid = thicket_common::compute_cid(b"nothing").unwrap();
        let err = Repository::load(storage, &cid).err().unwrap();
        assert_eq!(*err.kind(), RepoErrorKind::NotFound);
    }

    #[tokio::test]
    async fn export_to_file() {
        let repo = new_repo();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.car");
        repo.export_car_file(&path).await.unwrap();

        let parsed = crate::car::read_car(&path).await.unwrap();
        assert_eq!(parsed.root(), Some(repo.commit_cid()));
        assert!(parsed.blocks.contains_key(&repo.mst().root()));
    }
}

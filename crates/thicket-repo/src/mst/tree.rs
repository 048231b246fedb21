//! Immutable Merkle Search Tree operations

use super::iter::MstIter;
use super::node::{NodeData, NodeEntry};
use super::util;
use crate::car::{Block, CarWriter};
use crate::error::{MstError, RepoError, Result};
use crate::storage::BlockStore;
use bytes::Bytes;
use smol_str::SmolStr;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::Arc;
use thicket_common::{IpldCid, compute_cid, decode, verify_cid};

/// Write operation for batch application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Create new record (error if exists)
    Create {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Record CID
        cid: IpldCid,
    },

    /// Update existing record (error if not exists)
    Update {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// New record CID
        cid: IpldCid,
        /// Expected current CID, checked when present
        prev: Option<IpldCid>,
    },

    /// Delete existing record (error if not exists)
    Delete {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Expected current CID, checked when present
        prev: Option<IpldCid>,
    },
}

impl WriteOp {
    /// Key this operation touches
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Create { key, .. } | WriteOp::Update { key, .. } | WriteOp::Delete { key, .. } => {
                key.as_str()
            }
        }
    }
}

/// Counts gathered by [`Mst::verify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStats {
    /// Nodes visited, root included
    pub nodes: usize,
    /// Leaf entries
    pub leaves: usize,
    /// Node levels from the root down to the deepest node
    pub height: usize,
}

/// Decode an MST node block
pub(crate) fn parse_node(data: &[u8]) -> Result<NodeData> {
    let value = decode(data)?;
    Ok(NodeData::from_value(&value)?)
}

/// Load and decode a node; a missing block is a broken tree
pub(crate) fn read_node<S: BlockStore>(storage: &S, cid: &IpldCid) -> Result<NodeData> {
    let data = storage
        .get(cid)?
        .ok_or_else(|| RepoError::not_found("MST node", cid))?;
    parse_node(&data).map_err(|e| e.with_context(format!("MST node {}", cid)))
}

/// Find index of first leaf >= key
///
/// Returns `entries.len()` if all leaves are < key.
fn find_gt_or_equal_leaf_index(entries: &[NodeEntry], key: &str) -> usize {
    entries
        .iter()
        .position(|e| matches!(e, NodeEntry::Leaf { key: k, .. } if k.as_str() >= key))
        .unwrap_or(entries.len())
}

fn tree_before(entries: &[NodeEntry], index: usize) -> Option<IpldCid> {
    match index.checked_sub(1).and_then(|i| entries.get(i)) {
        Some(NodeEntry::Tree(cid)) => Some(*cid),
        _ => None,
    }
}

fn leaf_at<'e>(entries: &'e [NodeEntry], index: usize, key: &str) -> Option<&'e IpldCid> {
    match entries.get(index) {
        Some(NodeEntry::Leaf { key: k, value }) if k.as_str() == key => Some(value),
        _ => None,
    }
}

/// Working set for one logical change.
///
/// Nodes written while a change is in progress land in `pending` and are
/// only handed to the store by [`Stage::finish`], so a failed batch leaves
/// the store untouched. Nodes superseded mid-batch are never persisted.
pub(crate) struct Stage<'a, S: BlockStore> {
    storage: &'a S,
    pending: BTreeMap<IpldCid, Bytes>,
}

impl<'a, S: BlockStore> Stage<'a, S> {
    pub(crate) fn new(storage: &'a S) -> Self {
        Self {
            storage,
            pending: BTreeMap::new(),
        }
    }

    fn entries(&self, cid: &IpldCid) -> Result<Vec<NodeEntry>> {
        let node = match self.pending.get(cid) {
            Some(data) => parse_node(data)?,
            None => read_node(self.storage, cid)?,
        };
        Ok(node.to_entries()?)
    }

    fn store(&mut self, entries: &[NodeEntry]) -> Result<IpldCid> {
        let bytes = NodeData::from_entries(entries)?.encode();
        let cid = compute_cid(&bytes)?;
        self.pending.insert(cid, Bytes::from(bytes));
        Ok(cid)
    }

    /// Layer of a root node: its first leaf's layer, or one more than its
    /// only subtree's. Empty trees sit at layer 0.
    pub(crate) fn root_layer(&self, root: &IpldCid) -> Result<usize> {
        let mut cid = *root;
        let mut depth = 0;
        loop {
            let entries = self.entries(&cid)?;
            if let Some(key) = entries.iter().find_map(NodeEntry::leaf_key) {
                return Ok(util::layer_for_key(key) + depth);
            }
            match entries.first() {
                Some(NodeEntry::Tree(child)) => {
                    cid = *child;
                    depth += 1;
                }
                _ => return Ok(0),
            }
        }
    }

    fn get(&self, root: &IpldCid, key: &str) -> Result<Option<IpldCid>> {
        let mut cid = *root;
        loop {
            let entries = self.entries(&cid)?;
            let index = find_gt_or_equal_leaf_index(&entries, key);
            if let Some(value) = leaf_at(&entries, index, key) {
                return Ok(Some(*value));
            }
            match tree_before(&entries, index) {
                Some(child) => cid = child,
                None => return Ok(None),
            }
        }
    }

    fn insert(&mut self, root: &IpldCid, key: &str, value: IpldCid) -> Result<IpldCid> {
        let layer = self.root_layer(root)?;
        let entries = self.entries(root)?;
        let entries = self.add(entries, layer, key, value)?;
        self.store(&entries)
    }

    fn remove(&mut self, root: &IpldCid, key: &str) -> Result<IpldCid> {
        let entries = self.entries(root)?;
        let entries = self.delete(entries, key)?;
        match entries.as_slice() {
            [NodeEntry::Tree(child)] => self.trim_top(*child),
            _ => self.store(&entries),
        }
    }

    /// Insert or replace a key in a node at `layer`, returning its new entries
    fn add(
        &mut self,
        mut entries: Vec<NodeEntry>,
        layer: usize,
        key: &str,
        value: IpldCid,
    ) -> Result<Vec<NodeEntry>> {
        let key_layer = util::layer_for_key(key);
        let index = find_gt_or_equal_leaf_index(&entries, key);
        let leaf = NodeEntry::Leaf {
            key: SmolStr::new(key),
            value,
        };

        if key_layer == layer {
            if leaf_at(&entries, index, key).is_some() {
                entries[index] = leaf;
                return Ok(entries);
            }
            match tree_before(&entries, index) {
                // Prev is Tree - split it around key
                Some(child) => {
                    let child_entries = self.entries(&child)?;
                    let (left, right) = self.split_around(child_entries, key)?;
                    let mut replacement = Vec::with_capacity(3);
                    replacement.extend(left.map(NodeEntry::Tree));
                    replacement.push(leaf);
                    replacement.extend(right.map(NodeEntry::Tree));
                    entries.splice(index - 1..index, replacement);
                }
                None => entries.insert(index, leaf),
            }
            Ok(entries)
        } else if key_layer < layer {
            match tree_before(&entries, index) {
                Some(child) => {
                    let child_entries = self.entries(&child)?;
                    let updated = self.add(child_entries, layer - 1, key, value)?;
                    entries[index - 1] = NodeEntry::Tree(self.store(&updated)?);
                }
                None => {
                    let created = self.add(Vec::new(), layer - 1, key, value)?;
                    entries.insert(index, NodeEntry::Tree(self.store(&created)?));
                }
            }
            Ok(entries)
        } else {
            // Key belongs above this node: split it and stack gap nodes
            // until the two halves reach the key's layer
            let (mut left, mut right) = self.split_around(entries, key)?;
            for _ in 1..key_layer - layer {
                if let Some(l) = left {
                    left = Some(self.store(&[NodeEntry::Tree(l)])?);
                }
                if let Some(r) = right {
                    right = Some(self.store(&[NodeEntry::Tree(r)])?);
                }
            }
            let mut root = Vec::with_capacity(3);
            root.extend(left.map(NodeEntry::Tree));
            root.push(leaf);
            root.extend(right.map(NodeEntry::Tree));
            Ok(root)
        }
    }

    /// Split a node around a key into stored left (< key) and right (>= key)
    /// halves. Either side is `None` when empty.
    fn split_around(
        &mut self,
        mut entries: Vec<NodeEntry>,
        key: &str,
    ) -> Result<(Option<IpldCid>, Option<IpldCid>)> {
        let index = find_gt_or_equal_leaf_index(&entries, key);
        let mut right = entries.split_off(index);
        let mut left = entries;

        // If last entry in left is a Tree, recursively split it
        if let Some(NodeEntry::Tree(last)) = left.last() {
            let last = *last;
            left.pop();
            let child_entries = self.entries(&last)?;
            let (split_left, split_right) = self.split_around(child_entries, key)?;
            left.extend(split_left.map(NodeEntry::Tree));
            if let Some(sr) = split_right {
                right.insert(0, NodeEntry::Tree(sr));
            }
        }

        let left = match left.is_empty() {
            true => None,
            false => Some(self.store(&left)?),
        };
        let right = match right.is_empty() {
            true => None,
            false => Some(self.store(&right)?),
        };
        Ok((left, right))
    }

    /// Remove a key from a node, returning its new entries
    fn delete(&mut self, mut entries: Vec<NodeEntry>, key: &str) -> Result<Vec<NodeEntry>> {
        let index = find_gt_or_equal_leaf_index(&entries, key);

        if leaf_at(&entries, index, key).is_some() {
            let next = match entries.get(index + 1) {
                Some(NodeEntry::Tree(cid)) => Some(*cid),
                _ => None,
            };
            match (tree_before(&entries, index), next) {
                // Subtrees on both sides become adjacent - merge them
                (Some(prev), Some(next)) => {
                    let merged = self.append_merge(prev, next)?;
                    entries.splice(index - 1..=index + 1, [NodeEntry::Tree(merged)]);
                }
                _ => {
                    entries.remove(index);
                }
            }
            return Ok(entries);
        }

        if let Some(child) = tree_before(&entries, index) {
            let child_entries = self.entries(&child)?;
            let updated = self.delete(child_entries, key)?;
            if updated.is_empty() {
                entries.remove(index - 1);
            } else {
                entries[index - 1] = NodeEntry::Tree(self.store(&updated)?);
            }
            return Ok(entries);
        }

        Err(RepoError::not_found("key", key))
    }

    /// Merge two sibling subtrees; every key in `right` is above every key
    /// in `left`.
    fn append_merge(&mut self, left: IpldCid, right: IpldCid) -> Result<IpldCid> {
        let mut left_entries = self.entries(&left)?;
        let mut right_entries = self.entries(&right)?;

        if let (Some(NodeEntry::Tree(a)), Some(NodeEntry::Tree(b))) =
            (left_entries.last(), right_entries.first())
        {
            let merged = self.append_merge(*a, *b)?;
            left_entries.pop();
            right_entries[0] = NodeEntry::Tree(merged);
        }

        left_entries.append(&mut right_entries);
        self.store(&left_entries)
    }

    /// Descend through roots that hold nothing but a subtree
    fn trim_top(&self, mut cid: IpldCid) -> Result<IpldCid> {
        loop {
            match self.entries(&cid)?.as_slice() {
                [NodeEntry::Tree(child)] => cid = *child,
                _ => return Ok(cid),
            }
        }
    }

    /// Build the entries of one node at `layer` from sorted, layered items
    fn build(&mut self, items: &[(SmolStr, IpldCid, usize)], layer: usize) -> Result<Vec<NodeEntry>> {
        let mut entries = Vec::new();
        let mut run_start = None;
        for (i, (key, value, key_layer)) in items.iter().enumerate() {
            if *key_layer == layer {
                if let Some(start) = run_start.take() {
                    let subtree = self.build_subtree(&items[start..i], layer)?;
                    entries.push(NodeEntry::Tree(subtree));
                }
                entries.push(NodeEntry::Leaf {
                    key: key.clone(),
                    value: *value,
                });
            } else if run_start.is_none() {
                run_start = Some(i);
            }
        }
        if let Some(start) = run_start {
            let subtree = self.build_subtree(&items[start..], layer)?;
            entries.push(NodeEntry::Tree(subtree));
        }
        Ok(entries)
    }

    fn build_subtree(&mut self, items: &[(SmolStr, IpldCid, usize)], layer: usize) -> Result<IpldCid> {
        let child_layer = layer
            .checked_sub(1)
            .ok_or_else(|| RepoError::invalid_mst("key layer below zero"))?;
        let entries = self.build(items, child_layer)?;
        self.store(&entries)
    }

    /// Take the staged nodes reachable from `root` without persisting them.
    ///
    /// Unreachable staged nodes are intermediate states and are dropped.
    pub(crate) fn drain(mut self, root: IpldCid) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        let mut queue = vec![root];
        while let Some(cid) = queue.pop() {
            let Some(data) = self.pending.remove(&cid) else {
                continue;
            };
            queue.extend(parse_node(&data)?.subtrees());
            blocks.push(Block::new(cid, data));
        }
        Ok(blocks)
    }

    /// Persist the staged nodes reachable from `root` and return them.
    pub(crate) fn finish(self, root: IpldCid) -> Result<Vec<Block>> {
        let storage = self.storage;
        let blocks = self.drain(root)?;
        storage.put_many(blocks.iter().map(|b| (b.cid, b.data.clone())))?;
        Ok(blocks)
    }
}

/// Immutable Merkle Search Tree
///
/// MST operations return new tree instances, leaving the original unchanged.
/// A handle is just a root CID plus shared storage: nodes refer to each other
/// only by CID and are loaded on demand, so two versions of a tree share
/// every subtree they have in common.
///
/// # Layer-based structure
///
/// Keys are hashed (SHA-256) and leading zero bits determine layer:
/// - More leading zeros = higher layer (closer to the root)
/// - Layer = floor(leading_zeros / 2) for ~4 fanout
/// - Deterministic and insertion-order independent
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use thicket_common::compute_cid;
/// use thicket_repo::mst::Mst;
/// use thicket_repo::storage::MemoryBlockStore;
///
/// let storage = Arc::new(MemoryBlockStore::new());
/// let record = compute_cid(b"record").unwrap();
///
/// let empty = Mst::empty(storage.clone()).unwrap();
/// let tree = empty.add("app.bsky.feed.post/3jui7kd54zh2y", record).unwrap();
///
/// assert_eq!(tree.get("app.bsky.feed.post/3jui7kd54zh2y").unwrap(), Some(record));
/// assert_eq!(empty.get("app.bsky.feed.post/3jui7kd54zh2y").unwrap(), None);
/// ```
#[derive(Debug)]
pub struct Mst<S: BlockStore> {
    storage: Arc<S>,
    root: IpldCid,
}

impl<S: BlockStore> Clone for Mst<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            root: self.root,
        }
    }
}

impl<S: BlockStore> Mst<S> {
    /// Create an empty tree, storing its root node
    pub fn empty(storage: Arc<S>) -> Result<Self> {
        let root = storage.put_bytes(&NodeData::empty().encode())?;
        Ok(Self { storage, root })
    }

    /// Open an existing tree from its root CID
    ///
    /// Nothing is read until the tree is queried; use [`Mst::verify`] to
    /// check a tree from an untrusted source.
    pub fn load(storage: Arc<S>, root: IpldCid) -> Self {
        Self { storage, root }
    }

    /// Build the canonical tree for a set of entries, in any order.
    ///
    /// Repeated keys with the same value collapse; repeated keys with
    /// different values are rejected.
    pub fn build<K: Into<SmolStr>>(
        storage: Arc<S>,
        entries: impl IntoIterator<Item = (K, IpldCid)>,
    ) -> Result<Self> {
        Ok(Self::build_with_blocks(storage, entries)?.0)
    }

    pub(crate) fn build_with_blocks<K: Into<SmolStr>>(
        storage: Arc<S>,
        entries: impl IntoIterator<Item = (K, IpldCid)>,
    ) -> Result<(Self, Vec<Block>)> {
        let mut sorted = BTreeMap::new();
        for (key, value) in entries {
            let key = key.into();
            util::validate_key(&key)?;
            match sorted.get(&key) {
                Some(existing) if *existing != value => {
                    return Err(MstError::ConflictingDuplicate {
                        key: key.to_string(),
                    }
                    .into());
                }
                Some(_) => {}
                None => {
                    sorted.insert(key, value);
                }
            }
        }

        let items: Vec<_> = sorted
            .into_iter()
            .map(|(key, value)| {
                let layer = util::layer_for_key(&key);
                (key, value, layer)
            })
            .collect();
        let top = items.iter().map(|(_, _, layer)| *layer).max().unwrap_or(0);

        let (root, blocks) = {
            let mut stage = Stage::new(&*storage);
            let entries = stage.build(&items, top)?;
            let root = stage.store(&entries)?;
            (root, stage.finish(root)?)
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(entries = items.len(), nodes = blocks.len(), %root, "built tree");

        Ok((Self { storage, root }, blocks))
    }

    /// Root node CID
    pub fn root(&self) -> IpldCid {
        self.root
    }

    /// Get the storage reference
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Layer of the root node
    pub fn layer(&self) -> Result<usize> {
        Stage::new(&*self.storage).root_layer(&self.root)
    }

    /// Get a value by key
    pub fn get(&self, key: &str) -> Result<Option<IpldCid>> {
        util::validate_key(key)?;
        Stage::new(&*self.storage).get(&self.root, key)
    }

    /// Add or replace a key (returns new tree)
    pub fn add(&self, key: &str, cid: IpldCid) -> Result<Self> {
        util::validate_key(key)?;
        let mut stage = Stage::new(&*self.storage);
        let root = stage.insert(&self.root, key, cid)?;
        self.finish(stage, root)
    }

    /// Delete a key (returns new tree); a missing key is `NotFound`
    pub fn delete(&self, key: &str) -> Result<Self> {
        util::validate_key(key)?;
        let mut stage = Stage::new(&*self.storage);
        let root = stage.remove(&self.root, key)?;
        self.finish(stage, root)
    }

    /// Set a key to a value, or remove it with `None`.
    ///
    /// Removing a key that is not present returns the same tree.
    pub fn update(&self, key: &str, cid: Option<IpldCid>) -> Result<Self> {
        match cid {
            Some(cid) => self.add(key, cid),
            None if self.get(key)?.is_none() => Ok(self.clone()),
            None => self.delete(key),
        }
    }

    /// Apply a batch of writes atomically (returns new tree)
    ///
    /// Nothing is persisted unless every operation succeeds.
    pub fn apply_ops(&self, ops: &[WriteOp]) -> Result<Self> {
        Ok(self.apply_ops_with_blocks(ops)?.0)
    }

    /// Like [`Mst::apply_ops`], also returning the node blocks written
    pub(crate) fn apply_ops_with_blocks(&self, ops: &[WriteOp]) -> Result<(Self, Vec<Block>)> {
        let (root, blocks) = self.stage_ops(ops)?;
        self.storage
            .put_many(blocks.iter().map(|b| (b.cid, b.data.clone())))?;
        Ok((Self::load(self.storage.clone(), root), blocks))
    }

    /// Run a batch of writes in memory, returning the new root and the node
    /// blocks it needs. Nothing reaches storage.
    pub(crate) fn stage_ops(&self, ops: &[WriteOp]) -> Result<(IpldCid, Vec<Block>)> {
        let mut stage = Stage::new(&*self.storage);
        let mut root = self.root;

        for op in ops {
            util::validate_key(op.key())?;
            let current = stage.get(&root, op.key())?;
            root = match op {
                WriteOp::Create { key, cid } => {
                    if current.is_some() {
                        return Err(RepoError::already_exists("record", key));
                    }
                    stage.insert(&root, key, *cid)?
                }
                WriteOp::Update { key, cid, prev } => {
                    let current = current.ok_or_else(|| RepoError::not_found("record", key))?;
                    check_prev(key, *prev, current)?;
                    stage.insert(&root, key, *cid)?
                }
                WriteOp::Delete { key, prev } => {
                    let current = current.ok_or_else(|| RepoError::not_found("record", key))?;
                    check_prev(key, *prev, current)?;
                    stage.remove(&root, key)?
                }
            };
        }

        Ok((root, stage.drain(root)?))
    }

    fn finish(&self, stage: Stage<'_, S>, root: IpldCid) -> Result<Self> {
        stage.finish(root)?;
        Ok(Self::load(self.storage.clone(), root))
    }

    /// Iterate `(key, value)` pairs whose key starts with `prefix`, in key
    /// order. An empty prefix lists everything.
    pub fn list(&self, prefix: &str) -> MstIter<S> {
        MstIter::new(self.storage.clone(), self.root, prefix)
    }

    /// Collect [`Mst::list`] into a vector
    pub fn list_keys(&self, prefix: &str) -> Result<Vec<(SmolStr, IpldCid)>> {
        self.list(prefix).collect()
    }

    /// All leaf entries in key order
    pub fn leaves(&self) -> Result<Vec<(SmolStr, IpldCid)>> {
        self.list_keys("")
    }

    /// Get all CIDs in the merkle path to a key
    ///
    /// For a key that exists:
    /// - Returns: `[root_cid, intermediate_node_cid?, ..., record_cid]`
    ///
    /// For a key that doesn't exist:
    /// - Returns: `[root_cid, intermediate_node_cid?, ...]` (proves absence)
    pub fn cids_for_path(&self, key: &str) -> Result<Vec<IpldCid>> {
        util::validate_key(key)?;

        let mut cids = vec![self.root];
        let mut cid = self.root;
        loop {
            let entries = read_node(&*self.storage, &cid)?.to_entries()?;
            let index = find_gt_or_equal_leaf_index(&entries, key);
            if let Some(value) = leaf_at(&entries, index, key) {
                cids.push(*value);
                return Ok(cids);
            }
            match tree_before(&entries, index) {
                Some(child) => {
                    cids.push(child);
                    cid = child;
                }
                None => return Ok(cids),
            }
        }
    }

    /// Check every structural rule of the tree.
    ///
    /// Recomputes each node's CID, checks that every key sits at its own
    /// layer, that keys ascend within the bounds set by the parent, that
    /// child nodes sit exactly one layer down and that only the root may be
    /// empty. Any violation is an `Integrity` error; nothing is repaired.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self), fields(root = %self.root)))]
    pub fn verify(&self) -> Result<TreeStats> {
        let mut stats = TreeStats::default();
        self.verify_node(&self.root, None, (None, None), 1, &mut stats)?;
        Ok(stats)
    }

    fn verify_node(
        &self,
        cid: &IpldCid,
        layer: Option<usize>,
        bounds: (Option<&str>, Option<&str>),
        depth: usize,
        stats: &mut TreeStats,
    ) -> Result<()> {
        let data = self
            .storage
            .get(cid)?
            .ok_or_else(|| RepoError::not_found("MST node", cid))?;
        if !verify_cid(cid, &data) {
            return Err(RepoError::cid_mismatch(cid));
        }
        let value = decode(&data)
            .map_err(|e| RepoError::invalid_mst(format!("node {} is not canonical: {}", cid, e)))?;
        let entries = NodeData::from_value(&value)
            .and_then(|node| node.to_entries())
            .map_err(|e| RepoError::invalid_mst(format!("node {}: {}", cid, e)))?;

        stats.nodes += 1;
        stats.height = stats.height.max(depth);

        let is_root = layer.is_none();
        if entries.is_empty() {
            return match is_root {
                true => Ok(()),
                false => Err(RepoError::invalid_mst(format!("empty non-root node {}", cid))),
            };
        }

        let layer = match layer {
            Some(layer) => layer,
            None => match entries.iter().find_map(NodeEntry::leaf_key) {
                Some(key) => util::layer_for_key(key),
                None => {
                    return Err(RepoError::invalid_mst(format!(
                        "root {} holds only a subtree",
                        cid
                    )));
                }
            },
        };

        let (mut lower, upper) = bounds;
        for (i, entry) in entries.iter().enumerate() {
            match entry {
                NodeEntry::Leaf { key, .. } => {
                    util::validate_key(key)
                        .map_err(|_| RepoError::invalid_mst(format!("invalid key {:?}", key)))?;
                    let key_layer = util::layer_for_key(key);
                    if key_layer != layer {
                        return Err(RepoError::invalid_mst(format!(
                            "key {} has layer {} but sits in a layer {} node",
                            key, key_layer, layer
                        )));
                    }
                    let below = lower.is_some_and(|l| key.as_str() <= l);
                    let above = upper.is_some_and(|u| key.as_str() >= u);
                    if below || above {
                        return Err(RepoError::invalid_mst(format!(
                            "key {} is outside its parent's range",
                            key
                        )));
                    }
                    stats.leaves += 1;
                    lower = Some(key.as_str());
                }
                NodeEntry::Tree(child) => {
                    let child_layer = layer.checked_sub(1).ok_or_else(|| {
                        RepoError::invalid_mst(format!("layer 0 node {} has a subtree", cid))
                    })?;
                    let next = entries.get(i + 1).and_then(NodeEntry::leaf_key).or(upper);
                    self.verify_node(child, Some(child_layer), (lower, next), depth + 1, stats)?;
                }
            }
        }
        Ok(())
    }

    /// Every node and record block reachable from the root, in export order:
    /// each node, then the records it points to, then its subtrees.
    ///
    /// Records missing from storage are skipped; missing nodes are an error.
    pub fn collect_blocks(&self) -> Result<Vec<(IpldCid, Bytes)>> {
        let mut blocks = Vec::new();
        let mut seen = BTreeSet::new();
        self.export(&self.root, &mut seen, &mut |cid, data| {
            blocks.push((cid, data));
            Ok(())
        })?;
        Ok(blocks)
    }

    /// Stream [`Mst::collect_blocks`] into a container writer, returning the
    /// number of blocks written.
    pub fn write_blocks<W: Write>(&self, writer: &mut CarWriter<W>) -> Result<usize> {
        let mut written = 0;
        let mut seen = BTreeSet::new();
        self.export(&self.root, &mut seen, &mut |cid, data| {
            writer.write_block(&cid, &data)?;
            written += 1;
            Ok(())
        })?;
        Ok(written)
    }

    fn export(
        &self,
        cid: &IpldCid,
        seen: &mut BTreeSet<IpldCid>,
        sink: &mut dyn FnMut(IpldCid, Bytes) -> Result<()>,
    ) -> Result<()> {
        if !seen.insert(*cid) {
            return Ok(());
        }
        let data = self
            .storage
            .get(cid)?
            .ok_or_else(|| RepoError::not_found("MST node", cid))?;
        let node = parse_node(&data)?;
        sink(*cid, data)?;

        for entry in &node.entries {
            if !seen.insert(entry.value) {
                continue;
            }
            if let Some(record) = self.storage.get(&entry.value)? {
                sink(entry.value, record)?;
            }
        }
        for child in node.subtrees() {
            self.export(&child, seen, sink)?;
        }
        Ok(())
    }
}

fn check_prev(key: &str, expected: Option<IpldCid>, current: IpldCid) -> Result<()> {
    match expected {
        Some(expected) if expected != current => Err(RepoError::conflict(format!(
            "prev mismatch for {}: expected {}, found {}",
            key, expected, current
        ))),
        _ => Ok(()),
    }
}

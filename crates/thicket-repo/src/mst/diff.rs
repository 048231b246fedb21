//! MST diff calculation

use super::node::NodeEntry;
use super::tree::{Mst, WriteOp, read_node};
use crate::error::Result;
use crate::storage::BlockStore;
use smol_str::SmolStr;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use thicket_common::IpldCid;

/// Diff between two MST states
///
/// Represents the changes needed to transform one tree into another.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MstDiff {
    /// New records created (key, new CID)
    pub creates: Vec<(SmolStr, IpldCid)>,

    /// Records updated (key, new CID, old CID)
    pub updates: Vec<(SmolStr, IpldCid, IpldCid)>,

    /// Records deleted (key, old CID)
    pub deletes: Vec<(SmolStr, IpldCid)>,

    /// MST nodes present only in the new tree
    pub created_nodes: Vec<IpldCid>,

    /// MST nodes present only in the old tree
    pub removed_nodes: Vec<IpldCid>,
}

impl MstDiff {
    /// Check if diff is empty (no changes)
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Count total operations
    pub fn op_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    /// Write operations that turn the old tree into the new one
    ///
    /// Updates and deletes carry the old CID as `prev`.
    pub fn to_write_ops(&self) -> Vec<WriteOp> {
        let mut ops = Vec::with_capacity(self.op_count());
        for (key, cid) in &self.creates {
            ops.push(WriteOp::Create {
                key: key.clone(),
                cid: *cid,
            });
        }
        for (key, cid, prev) in &self.updates {
            ops.push(WriteOp::Update {
                key: key.clone(),
                cid: *cid,
                prev: Some(*prev),
            });
        }
        for (key, prev) in &self.deletes {
            ops.push(WriteOp::Delete {
                key: key.clone(),
                prev: Some(*prev),
            });
        }
        ops
    }
}

#[derive(Debug, Clone)]
enum Item {
    Leaf(SmolStr, IpldCid),
    Tree { cid: IpldCid, layer: usize },
}

/// One side of the diff: the not-yet-visited part of a tree in key order,
/// with subtrees left unexpanded until they have to be compared.
struct Side<'a, S: BlockStore> {
    storage: &'a S,
    // next item on top
    stack: Vec<Item>,
}

impl<'a, S: BlockStore> Side<'a, S> {
    fn new(storage: &'a S, root: IpldCid, layer: usize) -> Self {
        Self {
            storage,
            stack: vec![Item::Tree { cid: root, layer }],
        }
    }

    fn peek(&self) -> Option<Item> {
        self.stack.last().cloned()
    }

    fn skip(&mut self) {
        self.stack.pop();
    }

    /// Replace the subtree on top with its entries, recording its CID
    fn expand(&mut self, visited: &mut Vec<IpldCid>) -> Result<()> {
        let Some(Item::Tree { cid, layer }) = self.stack.pop() else {
            return Ok(());
        };
        let entries = read_node(self.storage, &cid)?.to_entries()?;
        let child_layer = layer.saturating_sub(1);
        self.stack.extend(entries.into_iter().rev().map(|entry| match entry {
            NodeEntry::Tree(cid) => Item::Tree {
                cid,
                layer: child_layer,
            },
            NodeEntry::Leaf { key, value } => Item::Leaf(key, value),
        }));
        visited.push(cid);
        Ok(())
    }
}

impl<S: BlockStore> Mst<S> {
    /// Compute diff from this tree to another
    ///
    /// Returns operations needed to transform `self` into `other`.
    /// - Creates: keys in `other` but not in `self`
    /// - Updates: keys in both but with different CIDs
    /// - Deletes: keys in `self` but not in `other`
    ///
    /// Both trees are walked in key order together. When the two walks reach
    /// the same subtree CID at the same point, the whole subtree is skipped.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub fn diff(&self, other: &Mst<S>) -> Result<MstDiff> {
        let mut diff = MstDiff::default();
        if self.root() == other.root() {
            return Ok(diff);
        }

        let mut old = Side::new(&**self.storage(), self.root(), self.layer()?);
        let mut new = Side::new(&**other.storage(), other.root(), other.layer()?);

        loop {
            match (old.peek(), new.peek()) {
                (None, None) => break,

                (Some(Item::Tree { cid: a, layer: la }), Some(Item::Tree { cid: b, layer: lb })) => {
                    if a == b {
                        old.skip();
                        new.skip();
                    } else {
                        // Open the higher subtree first so equal subtrees
                        // can still line up further down
                        match la.cmp(&lb) {
                            Ordering::Greater => old.expand(&mut diff.removed_nodes)?,
                            Ordering::Less => new.expand(&mut diff.created_nodes)?,
                            Ordering::Equal => {
                                old.expand(&mut diff.removed_nodes)?;
                                new.expand(&mut diff.created_nodes)?;
                            }
                        }
                    }
                }
                (Some(Item::Tree { .. }), _) => old.expand(&mut diff.removed_nodes)?,
                (_, Some(Item::Tree { .. })) => new.expand(&mut diff.created_nodes)?,

                (Some(Item::Leaf(old_key, old_cid)), Some(Item::Leaf(new_key, new_cid))) => {
                    match old_key.cmp(&new_key) {
                        Ordering::Equal => {
                            if old_cid != new_cid {
                                diff.updates.push((old_key, new_cid, old_cid));
                            }
                            old.skip();
                            new.skip();
                        }
                        Ordering::Less => {
                            diff.deletes.push((old_key, old_cid));
                            old.skip();
                        }
                        Ordering::Greater => {
                            diff.creates.push((new_key, new_cid));
                            new.skip();
                        }
                    }
                }
                (Some(Item::Leaf(key, cid)), None) => {
                    diff.deletes.push((key, cid));
                    old.skip();
                }
                (None, Some(Item::Leaf(key, cid))) => {
                    diff.creates.push((key, cid));
                    new.skip();
                }
            }
        }

        // A subtree can be opened on one side only because the other side
        // reached it at a different point in the walk; it is shared all the same
        let created: BTreeSet<_> = diff.created_nodes.iter().copied().collect();
        let removed: BTreeSet<_> = diff.removed_nodes.iter().copied().collect();
        diff.created_nodes.retain(|cid| !removed.contains(cid));
        diff.removed_nodes.retain(|cid| !created.contains(cid));

        #[cfg(feature = "tracing")]
        tracing::debug!(
            ops = diff.op_count(),
            created_nodes = diff.created_nodes.len(),
            removed_nodes = diff.removed_nodes.len(),
            "diffed trees"
        );

        Ok(diff)
    }
}

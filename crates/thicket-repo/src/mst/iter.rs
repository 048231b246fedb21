//! Ordered, prefix-bounded traversal of an MST

use super::node::NodeEntry;
use super::tree::read_node;
use crate::error::Result;
use crate::storage::BlockStore;
use smol_str::SmolStr;
use std::fmt;
use std::iter::FusedIterator;
use std::sync::Arc;
use thicket_common::IpldCid;

#[derive(Debug, Clone)]
enum Pending {
    Leaf(SmolStr, IpldCid),
    Tree(IpldCid),
}

/// In-order iterator over `(key, value)` pairs under a key prefix
///
/// Nodes are loaded one at a time as the traversal reaches them. Subtrees
/// that lie wholly before the prefix are never loaded, and iteration ends at
/// the first key past it.
///
/// An error (a missing or malformed node) is yielded once, after which the
/// iterator is exhausted. [`MstIter::restart`] rewinds to the first key.
pub struct MstIter<S: BlockStore> {
    storage: Arc<S>,
    root: IpldCid,
    prefix: SmolStr,
    // next item on top
    stack: Vec<Pending>,
}

impl<S: BlockStore> MstIter<S> {
    pub(crate) fn new(storage: Arc<S>, root: IpldCid, prefix: &str) -> Self {
        Self {
            storage,
            root,
            prefix: SmolStr::new(prefix),
            stack: vec![Pending::Tree(root)],
        }
    }

    /// Prefix this iterator is bounded by
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Rewind to the beginning
    pub fn restart(&mut self) {
        self.stack.clear();
        self.stack.push(Pending::Tree(self.root));
    }

    fn expand(&mut self, cid: &IpldCid) -> Result<()> {
        let entries = read_node(&*self.storage, cid)?.to_entries()?;
        self.stack.extend(entries.into_iter().rev().map(|entry| match entry {
            NodeEntry::Tree(cid) => Pending::Tree(cid),
            NodeEntry::Leaf { key, value } => Pending::Leaf(key, value),
        }));
        Ok(())
    }
}

impl<S: BlockStore> Clone for MstIter<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            root: self.root,
            prefix: self.prefix.clone(),
            stack: self.stack.clone(),
        }
    }
}

impl<S: BlockStore> fmt::Debug for MstIter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MstIter")
            .field("root", &self.root)
            .field("prefix", &self.prefix)
            .field("pending", &self.stack.len())
            .finish()
    }
}

impl<S: BlockStore> Iterator for MstIter<S> {
    type Item = Result<(SmolStr, IpldCid)>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(item) = self.stack.pop() {
            match item {
                Pending::Tree(cid) => {
                    // A subtree's keys are all below the leaf that follows it
                    // (in this node or an ancestor)
                    let before_prefix = matches!(
                        self.stack.last(),
                        Some(Pending::Leaf(next, _)) if next.as_str() <= self.prefix.as_str()
                    );
                    if before_prefix {
                        continue;
                    }
                    if let Err(e) = self.expand(&cid) {
                        self.stack.clear();
                        return Some(Err(e));
                    }
                }
                Pending::Leaf(key, value) => {
                    if key.starts_with(self.prefix.as_str()) {
                        return Some(Ok((key, value)));
                    }
                    if key.as_str() > self.prefix.as_str() {
                        self.stack.clear();
                        return None;
                    }
                }
            }
        }
        None
    }
}

impl<S: BlockStore> FusedIterator for MstIter<S> {}

//! MST node data structures
//!
//! Two representations of one node:
//!
//! - [`NodeData`] / [`TreeEntry`]: the wire format, prefix-compressed, with
//!   `left` and per-entry `tree` pointers.
//! - `Vec<`[`NodeEntry`]`>`: the flat form used by tree operations, with full
//!   keys and subtrees interleaved: `[Tree, Leaf, Tree, Leaf, Leaf, Tree]`.
//!
//! **Serialization (flat → wire):**
//! - First entry if `Tree` → becomes `left` pointer
//! - Each `Leaf` → becomes entry in `entries`
//! - `Tree` after `Leaf` → becomes that leaf's `tree` pointer
//!
//! **Deserialization (wire → flat):**
//! - `left` if present → prepend `Tree` entry
//! - Each entry → append `Leaf`
//! - Each `tree` if present → append `Tree` entry

use super::util::common_prefix_len;
use crate::error::{MstError, ShapeError};
use bytes::Bytes;
use smol_str::SmolStr;
use thicket_common::{IpldCid, Map, Value, encode};

const NODE: &str = "MST node";

/// Entry in an MST node - either a subtree or a leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEntry {
    /// Subtree reference, resolved through the block store
    Tree(IpldCid),

    /// Leaf node with key-value pair
    Leaf {
        /// Full key (not prefix-compressed in memory)
        key: SmolStr,
        /// CID of the record value
        value: IpldCid,
    },
}

impl NodeEntry {
    /// Check if this is a tree entry
    pub fn is_tree(&self) -> bool {
        matches!(self, NodeEntry::Tree(_))
    }

    /// Check if this is a leaf entry
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeEntry::Leaf { .. })
    }

    /// Get the key if this is a leaf
    pub fn leaf_key(&self) -> Option<&str> {
        match self {
            NodeEntry::Leaf { key, .. } => Some(key.as_str()),
            NodeEntry::Tree(_) => None,
        }
    }
}

/// Wire format entry (prefix-compressed leaf with optional subtree pointer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Bytes shared with the previous key in this node
    pub prefix_len: usize,
    /// Key bytes after the shared prefix
    pub key_suffix: Bytes,
    /// CID of the record value
    pub value: IpldCid,
    /// Subtree of keys between this entry and the next
    pub tree: Option<IpldCid>,
}

/// Wire format node data
///
/// Encodes as `{"e": [{"k", "p", "t", "v"}], "l": link|null}`. Absent
/// pointers are written as explicit `null`, never skipped: skipping would
/// change the bytes and therefore the CID.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeData {
    /// Left-most subtree pointer
    pub left: Option<IpldCid>,
    /// Entries in this node (sorted by full key, prefix-compressed)
    pub entries: Vec<TreeEntry>,
}

fn link_or_null(cid: Option<IpldCid>) -> Value {
    Value::from(cid)
}

fn optional_link(value: &Value, field: &str) -> Result<Option<IpldCid>, ShapeError> {
    match value {
        Value::Null => Ok(None),
        Value::Link(cid) => Ok(Some(*cid)),
        other => Err(ShapeError::invalid(
            NODE,
            format!("{} must be a link or null, got {}", field, other.kind()),
        )),
    }
}

fn has_exact_keys(map: &Map, keys: &[&str]) -> bool {
    map.len() == keys.len() && keys.iter().all(|k| map.contains_key(*k))
}

impl NodeData {
    /// Node with no entries and no left pointer
    pub fn empty() -> Self {
        Self::default()
    }

    /// Canonical object form
    pub fn to_value(&self) -> Value {
        let entries = self
            .entries
            .iter()
            .map(|e| {
                Value::map([
                    ("k", Value::Bytes(e.key_suffix.clone())),
                    ("p", Value::Unsigned(e.prefix_len as u64)),
                    ("t", link_or_null(e.tree)),
                    ("v", Value::Link(e.value)),
                ])
            })
            .collect();
        Value::map([
            ("e", Value::Array(entries)),
            ("l", link_or_null(self.left)),
        ])
    }

    /// Canonical bytes
    pub fn encode(&self) -> Vec<u8> {
        encode(&self.to_value())
    }

    /// Typed decode attempt.
    ///
    /// A map whose key set is not exactly `{e, l}` is a [`ShapeError::Mismatch`].
    /// A node-shaped map with bad field types, a non-zero first prefix, an
    /// over-long prefix, non-UTF-8 keys or non-ascending keys is
    /// [`ShapeError::Invalid`].
    pub fn from_value(value: &Value) -> Result<Self, ShapeError> {
        let map = value
            .as_map()
            .filter(|m| has_exact_keys(m, &["e", "l"]))
            .ok_or(ShapeError::Mismatch(NODE))?;

        let left = optional_link(&map["l"], "l")?;
        let raw_entries = map["e"]
            .as_array()
            .ok_or_else(|| ShapeError::invalid(NODE, "e must be an array"))?;

        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            let entry = raw
                .as_map()
                .filter(|m| has_exact_keys(m, &["k", "p", "t", "v"]))
                .ok_or_else(|| {
                    ShapeError::invalid(NODE, "entries must be maps of exactly {k, p, t, v}")
                })?;
            let prefix_len = entry["p"]
                .as_u64()
                .ok_or_else(|| ShapeError::invalid(NODE, "p must be an unsigned integer"))?;
            let key_suffix = entry["k"]
                .as_bytes()
                .ok_or_else(|| ShapeError::invalid(NODE, "k must be a byte string"))?
                .clone();
            let value = *entry["v"]
                .as_link()
                .ok_or_else(|| ShapeError::invalid(NODE, "v must be a link"))?;
            let tree = optional_link(&entry["t"], "t")?;
            entries.push(TreeEntry {
                prefix_len: usize::try_from(prefix_len)
                    .map_err(|_| ShapeError::invalid(NODE, "prefix length overflows"))?,
                key_suffix,
                value,
                tree,
            });
        }

        let node = Self { left, entries };
        node.keys()?;
        Ok(node)
    }

    /// Reconstruct the full keys, checking compression and ordering rules.
    pub fn keys(&self) -> Result<Vec<SmolStr>, ShapeError> {
        let mut keys: Vec<SmolStr> = Vec::with_capacity(self.entries.len());
        let mut last: Vec<u8> = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if i == 0 && entry.prefix_len != 0 {
                return Err(ShapeError::invalid(NODE, "first entry has a non-zero prefix"));
            }
            if entry.prefix_len > last.len() {
                return Err(ShapeError::invalid(
                    NODE,
                    format!(
                        "prefix length {} exceeds previous key length {}",
                        entry.prefix_len,
                        last.len()
                    ),
                ));
            }
            let mut full = last[..entry.prefix_len].to_vec();
            full.extend_from_slice(&entry.key_suffix);
            let key = std::str::from_utf8(&full)
                .map_err(|_| ShapeError::invalid(NODE, "key is not UTF-8"))?;
            if let Some(prev) = keys.last() {
                if prev.as_str() >= key {
                    return Err(ShapeError::invalid(
                        NODE,
                        format!("keys out of order: {:?} then {:?}", prev, key),
                    ));
                }
            }
            keys.push(SmolStr::new(key));
            last = full;
        }
        Ok(keys)
    }

    /// Serialize flat entries to wire format (with prefix compression)
    pub fn from_entries(entries: &[NodeEntry]) -> Result<Self, MstError> {
        let mut data = NodeData::empty();
        let mut iter = entries.iter().peekable();

        // First entry if Tree → becomes left pointer
        if let Some(NodeEntry::Tree(cid)) = iter.peek() {
            data.left = Some(*cid);
            iter.next();
        }

        let mut last_key = "";
        while let Some(entry) = iter.next() {
            let NodeEntry::Leaf { key, value } = entry else {
                return Err(MstError::InvalidNode("Two Trees adjacent in flat entries".into()));
            };

            // Check for Tree after this Leaf
            let tree = match iter.peek() {
                Some(NodeEntry::Tree(cid)) => {
                    let cid = *cid;
                    iter.next();
                    Some(cid)
                }
                _ => None,
            };

            let prefix_len = common_prefix_len(last_key, key);
            data.entries.push(TreeEntry {
                prefix_len,
                key_suffix: Bytes::copy_from_slice(&key.as_bytes()[prefix_len..]),
                value: *value,
                tree,
            });
            last_key = key.as_str();
        }

        Ok(data)
    }

    /// Deserialize wire format to flat entries
    pub fn to_entries(&self) -> Result<Vec<NodeEntry>, ShapeError> {
        let keys = self.keys()?;
        let mut entries = Vec::with_capacity(self.entries.len() * 2 + 1);

        if let Some(left) = self.left {
            entries.push(NodeEntry::Tree(left));
        }
        for (entry, key) in self.entries.iter().zip(keys) {
            entries.push(NodeEntry::Leaf {
                key,
                value: entry.value,
            });
            if let Some(tree) = entry.tree {
                entries.push(NodeEntry::Tree(tree));
            }
        }

        Ok(entries)
    }

    /// Child pointers in traversal order
    pub fn subtrees(&self) -> impl Iterator<Item = IpldCid> + '_ {
        self.left
            .into_iter()
            .chain(self.entries.iter().filter_map(|e| e.tree))
    }
}

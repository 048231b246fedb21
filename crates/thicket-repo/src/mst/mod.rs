//! Merkle Search Tree implementation

pub mod diff;
pub mod iter;
pub mod node;
pub mod tree;
pub mod util;

pub use diff::MstDiff;
pub use iter::MstIter;
pub use node::{NodeData, NodeEntry, TreeEntry};
pub use tree::{Mst, TreeStats, WriteOp};
pub use util::{common_prefix_len, layer_for_key, validate_key};

//! AT Protocol repository storage
//!
//! This crate provides the building blocks for storing and moving AT Protocol
//! repositories:
//!
//! - **MST (Merkle Search Tree)**: Immutable tree operations with deterministic structure
//! - **Commits**: Signed commit structures (versions 2 and 3) with signature verification
//! - **CAR I/O**: Streaming import and export in CAR (Content Addressable aRchive) format
//! - **Walker**: Single-pass classification of every block in a CAR stream
//! - **Storage**: Pluggable block storage abstraction with an in-memory implementation
//!
//! Canonical encoding and CIDs live in [`thicket_common`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use thicket_common::compute_cid;
//! use thicket_repo::{MemoryBlockStore, Mst};
//!
//! let storage = Arc::new(MemoryBlockStore::new());
//! let record = compute_cid(b"record").unwrap();
//!
//! let tree = Mst::build(
//!     storage,
//!     [("app.bsky.feed.post/3jui7kd54zh2y", record), ("app.bsky.feed.like/3jui7kd54zh2z", record)],
//! )
//! .unwrap();
//!
//! let keys: Vec<_> = tree.list_keys("app.bsky.feed.post/").unwrap();
//! assert_eq!(keys.len(), 1);
//! assert_eq!(tree.get("app.bsky.feed.post/3jui7kd54zh2y").unwrap(), Some(record));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// CAR (Content Addressable aRchive) utilities
pub mod car;
/// Commit structures and signature verification
pub mod commit;
pub mod error;
/// Merkle Search Tree implementation
pub mod mst;
/// High-level repository operations
pub mod repo;
/// Block storage abstraction
pub mod storage;
pub mod walk;

pub use car::{Block, CarHeader, CarOptions, SectionFraming};
pub use commit::{Commit, Revision, Signer, UnsignedCommit, Verifier};
pub use error::{BlockFault, RepoError, RepoErrorKind, Result};
pub use mst::{Mst, MstDiff, WriteOp};
pub use repo::{CommitData, RecordWrite, Repository};
pub use storage::{BlockStore, MemoryBlockStore};
pub use walk::{BlockKind, Visitor, WalkOptions, WalkStats, WalkedBlock, Walker};

//! Single-pass repository walking over CAR streams
//!
//! The walker reads one section at a time, verifies the block against its
//! CID, decodes it, and classifies it by trying the typed decoders in turn:
//! first [`Commit`], then [`NodeData`], and anything else is a record. A
//! decoder that reports a shape mismatch passes the block on to the next one;
//! a decoder that recognises the shape but rejects the content turns the block
//! into a [`BlockFault::Malformed`].
//!
//! Faults go to [`Visitor::fault`], separate from good blocks, and by default
//! the walk carries on past them. Any callback can return
//! [`ControlFlow::Break`] to stop before the next section is read.
//!
//! ```
//! use std::ops::ControlFlow;
//! use bytes::Bytes;
//! use thicket_common::compute_cid;
//! use thicket_repo::car::write_car_bytes;
//! use thicket_repo::walk::{BlockKind, walk};
//!
//! let data = Bytes::from_static(&[0xa0]);
//! let cid = compute_cid(&data).unwrap();
//! let car = write_car_bytes(vec![cid], [(cid, data)]).unwrap();
//!
//! let mut records = 0;
//! let report = walk(
//!     &car[..],
//!     |_header| ControlFlow::Continue(()),
//!     |block| {
//!         if matches!(block.kind, BlockKind::Record { .. }) {
//!             records += 1;
//!         }
//!         ControlFlow::Continue(())
//!     },
//! )
//! .unwrap();
//! assert_eq!(records, 1);
//! assert!(report.faults.is_empty());
//! assert!(report.stats.unresolved_roots.is_empty());
//! ```

use crate::car::{AsyncCarReader, Block, CarHeader, CarOptions, CarReader};
use crate::commit::Commit;
use crate::error::{BlockFault, ContainerError, Result, ShapeError};
use crate::mst::NodeData;
use bytes::Bytes;
use smol_str::SmolStr;
use std::collections::BTreeSet;
use std::io::Read;
use std::ops::ControlFlow;
use thicket_common::{DecodeOptions, IpldCid, Value, decode_with};
use tokio::io::AsyncRead;

/// Walker settings
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, serde::Serialize, serde::Deserialize)]
#[builder(start_fn = new)]
#[serde(default, rename_all = "camelCase")]
pub struct WalkOptions {
    /// Container framing and size limits
    #[builder(default)]
    pub car: CarOptions,

    /// Hash every block and report mismatches as faults
    #[builder(default = true)]
    pub verify_cids: bool,

    /// Decoder settings for block contents
    #[builder(default)]
    pub decode: DecodeOptions,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self::new().build()
    }
}

/// What a block turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    /// Signed repository commit
    Commit(Box<Commit>),
    /// MST node
    Node(NodeData),
    /// Anything else, with its `$type` when it has a text one
    Record {
        /// Value of the `$type` field
        record_type: Option<SmolStr>,
    },
}

impl BlockKind {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Commit(_) => "commit",
            BlockKind::Node(_) => "node",
            BlockKind::Record { .. } => "record",
        }
    }
}

/// A verified, decoded and classified block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedBlock {
    /// Position of the section in the stream, counting faulty ones
    pub index: usize,
    /// Block CID
    pub cid: IpldCid,
    /// Raw block bytes
    pub data: Bytes,
    /// Decoded value
    pub value: Value,
    /// Classification
    pub kind: BlockKind,
}

/// Callbacks driven by [`Walker`]
pub trait Visitor {
    /// Called once, before any block
    fn header(&mut self, header: &CarHeader) -> ControlFlow<()> {
        let _ = header;
        ControlFlow::Continue(())
    }

    /// Called for each good block, in stream order
    fn block(&mut self, block: WalkedBlock) -> ControlFlow<()>;

    /// Called for each block that could not be delivered
    fn fault(&mut self, fault: BlockFault) -> ControlFlow<()> {
        let _ = fault;
        ControlFlow::Continue(())
    }
}

/// Counts from a finished walk
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WalkStats {
    /// Sections read, faulty ones included
    pub sections: usize,
    /// Blocks delivered to the visitor
    pub blocks: usize,
    /// Delivered commits
    pub commits: usize,
    /// Delivered MST nodes
    pub nodes: usize,
    /// Delivered records
    pub records: usize,
    /// Faults reported
    pub faults: usize,
    /// Header roots that never appeared in the stream
    pub unresolved_roots: Vec<IpldCid>,
    /// Whether a callback stopped the walk early
    pub stopped: bool,
}

/// Streaming repository walker
#[derive(Debug, Clone, Default)]
pub struct Walker {
    options: WalkOptions,
}

impl Walker {
    /// Walker with the given options
    pub fn new(options: WalkOptions) -> Self {
        Self { options }
    }

    /// Options in effect
    pub fn options(&self) -> &WalkOptions {
        &self.options
    }

    /// Walk a synchronous stream
    ///
    /// Errors are reserved for failures that leave the stream unusable
    /// (truncation, bad header, I/O). Everything else is a fault.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub fn walk<R: Read>(&self, reader: R, visitor: &mut impl Visitor) -> Result<WalkStats> {
        let mut reader = CarReader::with_options(reader, self.options.car.clone())?;
        let mut progress = Progress::new(reader.header());
        if visitor.header(reader.header()).is_break() {
            return Ok(progress.stop());
        }
        loop {
            let next = reader.next_block();
            match progress.section(&self.options, next, visitor)? {
                Step::Next => {}
                Step::Stop => return Ok(progress.stop()),
                Step::End => return Ok(progress.finish()),
            }
        }
    }

    /// Walk a tokio stream
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub async fn walk_async<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        visitor: &mut impl Visitor,
    ) -> Result<WalkStats> {
        let mut reader = AsyncCarReader::with_options(reader, self.options.car.clone()).await?;
        let mut progress = Progress::new(reader.header());
        if visitor.header(reader.header()).is_break() {
            return Ok(progress.stop());
        }
        loop {
            let next = reader.next_block().await;
            match progress.section(&self.options, next, visitor)? {
                Step::Next => {}
                Step::Stop => return Ok(progress.stop()),
                Step::End => return Ok(progress.finish()),
            }
        }
    }
}

/// Result of the closure-based [`walk`]
#[derive(Debug, Default)]
pub struct WalkReport {
    /// Counts
    pub stats: WalkStats,
    /// Every fault, in stream order
    pub faults: Vec<BlockFault>,
}

struct Closures<H, B> {
    on_header: H,
    on_block: B,
    faults: Vec<BlockFault>,
}

impl<H, B> Visitor for Closures<H, B>
where
    H: FnMut(&CarHeader) -> ControlFlow<()>,
    B: FnMut(WalkedBlock) -> ControlFlow<()>,
{
    fn header(&mut self, header: &CarHeader) -> ControlFlow<()> {
        (self.on_header)(header)
    }

    fn block(&mut self, block: WalkedBlock) -> ControlFlow<()> {
        (self.on_block)(block)
    }

    fn fault(&mut self, fault: BlockFault) -> ControlFlow<()> {
        self.faults.push(fault);
        ControlFlow::Continue(())
    }
}

/// Walk a stream with default options, using closures for the header and
/// blocks. Faults are collected into the report instead of stopping the walk.
pub fn walk<R, H, B>(reader: R, on_header: H, on_block: B) -> Result<WalkReport>
where
    R: Read,
    H: FnMut(&CarHeader) -> ControlFlow<()>,
    B: FnMut(WalkedBlock) -> ControlFlow<()>,
{
    let mut visitor = Closures {
        on_header,
        on_block,
        faults: Vec::new(),
    };
    let stats = Walker::default().walk(reader, &mut visitor)?;
    Ok(WalkReport {
        stats,
        faults: visitor.faults,
    })
}

enum Step {
    Next,
    Stop,
    End,
}

struct Progress {
    stats: WalkStats,
    roots: Vec<IpldCid>,
    seen_roots: BTreeSet<IpldCid>,
}

impl Progress {
    fn new(header: &CarHeader) -> Self {
        Self {
            stats: WalkStats::default(),
            roots: header.roots.clone(),
            seen_roots: BTreeSet::new(),
        }
    }

    fn section(
        &mut self,
        options: &WalkOptions,
        next: std::result::Result<Option<Block>, ContainerError>,
        visitor: &mut impl Visitor,
    ) -> Result<Step> {
        let index = self.stats.sections;
        let block = match next {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(Step::End),
            Err(source) if source.is_recoverable() => {
                self.stats.sections += 1;
                return Ok(self.fault(BlockFault::Section { index, source }, visitor));
            }
            Err(e) => return Err(e.into()),
        };
        self.stats.sections += 1;

        match classify(index, block, options) {
            Ok(walked) => {
                // a root only counts as resolved once its block checks out
                if self.roots.contains(&walked.cid) {
                    self.seen_roots.insert(walked.cid);
                }
                self.stats.blocks += 1;
                match walked.kind {
                    BlockKind::Commit(_) => self.stats.commits += 1,
                    BlockKind::Node(_) => self.stats.nodes += 1,
                    BlockKind::Record { .. } => self.stats.records += 1,
                }
                Ok(step(visitor.block(walked)))
            }
            Err(fault) => Ok(self.fault(fault, visitor)),
        }
    }

    fn fault(&mut self, fault: BlockFault, visitor: &mut impl Visitor) -> Step {
        self.stats.faults += 1;
        #[cfg(feature = "tracing")]
        tracing::debug!(index = fault.index(), error = %fault, "block fault");
        step(visitor.fault(fault))
    }

    fn stop(mut self) -> WalkStats {
        self.stats.stopped = true;
        self.finish()
    }

    fn finish(mut self) -> WalkStats {
        let seen = &self.seen_roots;
        self.stats.unresolved_roots = self
            .roots
            .into_iter()
            .filter(|root| !seen.contains(root))
            .collect();
        #[cfg(feature = "tracing")]
        tracing::debug!(
            sections = self.stats.sections,
            faults = self.stats.faults,
            stopped = self.stats.stopped,
            "walk finished"
        );
        self.stats
    }
}

fn step(flow: ControlFlow<()>) -> Step {
    match flow {
        ControlFlow::Continue(()) => Step::Next,
        ControlFlow::Break(()) => Step::Stop,
    }
}

/// Verify, decode and classify one block
pub fn classify(
    index: usize,
    block: Block,
    options: &WalkOptions,
) -> std::result::Result<WalkedBlock, BlockFault> {
    let Block { cid, data } = block;
    if options.verify_cids && !thicket_common::verify_cid(&cid, &data) {
        return Err(BlockFault::CidMismatch { index, cid });
    }
    let value = decode_with(&data, &options.decode)
        .map_err(|source| BlockFault::Undecodable { index, cid, source })?;

    let malformed = |source: ShapeError| BlockFault::Malformed { index, cid, source };
    let kind = match Commit::from_value(&value) {
        Ok(commit) => BlockKind::Commit(Box::new(commit)),
        Err(ShapeError::Mismatch(_)) => match NodeData::from_value(&value) {
            Ok(node) => BlockKind::Node(node),
            Err(ShapeError::Mismatch(_)) => BlockKind::Record {
                record_type: value.record_type().map(SmolStr::new),
            },
            Err(e) => return Err(malformed(e)),
        },
        Err(e) => return Err(malformed(e)),
    };

    Ok(WalkedBlock {
        index,
        cid,
        data,
        value,
        kind,
    })
}

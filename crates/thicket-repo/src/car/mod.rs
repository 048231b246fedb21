//! CAR (Content Addressable aRchive) container I/O
//!
//! A container is a header (`{roots: [link], version: 1}` as a canonical
//! object) followed by a sequence of sections, each holding one block and its
//! CID. Two section framings are supported, see [`SectionFraming`].
//!
//! Readers hold at most one block in memory at a time, so arbitrarily large
//! repositories can be streamed.
//!
//! # Examples
//!
//! ```
//! use bytes::Bytes;
//! use thicket_common::compute_cid;
//! use thicket_repo::car::{parse_car_bytes, write_car_bytes};
//!
//! let data = Bytes::from_static(&[0xa0]);
//! let cid = compute_cid(&data).unwrap();
//! let bytes = write_car_bytes(vec![cid], [(cid, data.clone())]).unwrap();
//!
//! let parsed = parse_car_bytes(&bytes).unwrap();
//! assert_eq!(parsed.root(), Some(&cid));
//! assert_eq!(parsed.blocks[&cid], data);
//! ```

use crate::error::{ContainerError, Result};
use bytes::Bytes;
use thicket_common::cid::read_cid_prefix;
use thicket_common::varint::encode_uvarint;
use thicket_common::{IpldCid, Value, compute_cid, decode, encode};

pub mod reader;
pub mod writer;

pub use reader::{
    AsyncCarReader, CarReader, ParsedCar, load_car_into, load_car_into_with, parse_car_bytes,
    parse_car_bytes_with, read_car, read_car_header,
};
pub use writer::{CarWriter, write_car, write_car_bytes};

/// Default cap on a single block (2 MiB)
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Default cap on the encoded header (64 KiB)
pub const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;

/// Longest CID a section may declare before it is skipped unread
pub(crate) const MAX_SECTION_CID: usize = 128;

/// How each section's lengths are laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SectionFraming {
    /// `{varint len(cid)+len(block)}{cid}{block}`: standard CARv1, the CID
    /// delimits itself
    #[default]
    CarV1,
    /// `{varint len(cid)}{cid}{varint len(block)}{block}`
    Split,
}

/// Container reader and writer settings
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, serde::Serialize, serde::Deserialize)]
#[builder(start_fn = new)]
#[serde(default, rename_all = "camelCase")]
pub struct CarOptions {
    /// Section framing
    #[builder(default)]
    pub framing: SectionFraming,

    /// Largest block accepted, checked before allocating
    #[builder(default = DEFAULT_MAX_BLOCK_SIZE)]
    pub max_block_size: usize,

    /// Largest encoded header accepted, checked before allocating
    #[builder(default = DEFAULT_MAX_HEADER_SIZE)]
    pub max_header_size: usize,
}

impl Default for CarOptions {
    fn default() -> Self {
        Self::new().build()
    }
}

/// Container header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarHeader {
    /// Format version, always 1
    pub version: u64,
    /// Root CIDs, typically the commit
    pub roots: Vec<IpldCid>,
}

impl CarHeader {
    /// Version 1 header with the given roots
    pub fn new(roots: Vec<IpldCid>) -> Self {
        Self { version: 1, roots }
    }

    /// Canonical object form
    pub fn to_value(&self) -> Value {
        Value::map([
            (
                "roots",
                Value::Array(self.roots.iter().copied().map(Value::Link).collect()),
            ),
            ("version", Value::Unsigned(self.version)),
        ])
    }

    /// Parse from a decoded header object.
    pub fn from_value(value: &Value) -> std::result::Result<Self, ContainerError> {
        let map = value
            .as_map()
            .ok_or_else(|| ContainerError::Header(format!("expected map, got {}", value.kind())))?;

        let version = map
            .get("version")
            .ok_or_else(|| ContainerError::Header("missing version".into()))?;
        let version = version
            .as_u64()
            .ok_or_else(|| ContainerError::Header(format!("version is {}", version.kind())))?;
        if version != 1 {
            return Err(ContainerError::UnsupportedVersion(version));
        }

        let roots = map
            .get("roots")
            .and_then(Value::as_array)
            .ok_or_else(|| ContainerError::Header("roots must be an array".into()))?
            .iter()
            .map(|root| {
                root.as_link()
                    .copied()
                    .ok_or_else(|| ContainerError::Header(format!("root is {}", root.kind())))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self { version, roots })
    }

    /// Canonical header bytes, without the length prefix
    pub fn encode(&self) -> Vec<u8> {
        encode(&self.to_value())
    }

    pub(crate) fn decode(bytes: &[u8]) -> std::result::Result<Self, ContainerError> {
        let value = decode(bytes).map_err(|e| ContainerError::Header(e.to_string()))?;
        Self::from_value(&value)
    }
}

/// A block and its CID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Content identifier
    pub cid: IpldCid,
    /// Canonical block bytes
    pub data: Bytes,
}

impl Block {
    /// Pair data with a CID the caller already has
    pub fn new(cid: IpldCid, data: Bytes) -> Self {
        Self { cid, data }
    }

    /// Encode a value canonically and compute its CID
    pub fn encode(value: &Value) -> Result<Self> {
        let data = encode(value);
        let cid = compute_cid(&data)?;
        Ok(Self {
            cid,
            data: Bytes::from(data),
        })
    }

    /// Whether the data hashes to the CID
    pub fn verify(&self) -> bool {
        thicket_common::verify_cid(&self.cid, &self.data)
    }
}

impl From<Block> for (IpldCid, Bytes) {
    fn from(block: Block) -> Self {
        (block.cid, block.data)
    }
}

/// Append one framed section to `out`.
pub(crate) fn encode_section(cid: &IpldCid, data: &[u8], framing: SectionFraming, out: &mut Vec<u8>) {
    let cid_bytes = cid.to_bytes();
    match framing {
        SectionFraming::CarV1 => {
            encode_uvarint((cid_bytes.len() + data.len()) as u64, out);
            out.extend_from_slice(&cid_bytes);
        }
        SectionFraming::Split => {
            encode_uvarint(cid_bytes.len() as u64, out);
            out.extend_from_slice(&cid_bytes);
            encode_uvarint(data.len() as u64, out);
        }
    }
    out.extend_from_slice(data);
}

/// Largest CARv1 section body worth reading for the given block limit
pub(crate) fn max_v1_section(options: &CarOptions) -> u64 {
    (options.max_block_size + MAX_SECTION_CID) as u64
}

/// Split a complete CARv1 section body into its CID and block.
///
/// The whole body has been consumed by the time this runs, so every failure
/// here is recoverable.
pub(crate) fn split_v1_section(
    body: Bytes,
    offset: u64,
    options: &CarOptions,
) -> std::result::Result<Block, ContainerError> {
    let (cid, used) =
        read_cid_prefix(&body).map_err(|source| ContainerError::InvalidCid { offset, source })?;
    let data = body.slice(used..);
    if data.len() > options.max_block_size {
        return Err(ContainerError::BlockTooLarge {
            offset,
            size: data.len() as u64,
            max: options.max_block_size,
        });
    }
    Ok(Block { cid, data })
}

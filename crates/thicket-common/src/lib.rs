//! Canonical encoding primitives for thicket repositories
//!
//! Everything a repository block is made of, below the level of trees and
//! commits:
//!
//! - [`varint`]: unsigned LEB128 varints used by CIDs and CAR framing
//! - [`cid`]: SHA-256 CIDv1 computation, parsing and verification
//! - [`value`]: the [`Value`] data model (CBOR without floats, plus links)
//! - [`codec`]: the strict canonical encoder and decoder
//!
//! Nothing here does I/O or allocates beyond the values it returns.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub use bytes;
pub use smol_str;

/// Canonical binary object codec
pub mod codec;
/// Content identifiers
pub mod cid;
/// Generic value model
pub mod value;
pub mod varint;

pub use cid::{
    CidError, IpldCid, cid_to_string, compute_cid, parse_cid_bytes, parse_cid_str, verify_cid,
};
pub use codec::{DecodeError, DecodeOptions, decode, decode_with, encode, encode_into};
pub use value::{Map, Value};

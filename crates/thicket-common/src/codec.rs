//! Canonical binary object codec.
//!
//! A strict subset of CBOR (the DAG-CBOR profile): definite lengths only,
//! minimal integer and length widths, text map keys in canonical order, tag
//! 42 for links and no floats. Every [`Value`] has exactly one encoding, so a
//! block's CID doubles as an equality check.
//!
//! ```
//! use thicket_common::codec::{decode, encode};
//! use thicket_common::value::Value;
//!
//! let value = Value::map([("b", Value::int(1)), ("a", Value::text("x"))]);
//! let bytes = encode(&value);
//! assert_eq!(decode(&bytes).unwrap(), value);
//! ```

use crate::cid::{CidError, IpldCid, parse_cid_bytes, write_cid_bytes};
use crate::value::{Map, Value, canonical_key_cmp};
use bytes::Bytes;
use smol_str::SmolStr;
use std::cmp::Ordering;

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;
const MAJOR_SIMPLE: u8 = 7;

/// CBOR tag for content-addressed links
pub const LINK_TAG: u64 = 42;

const FALSE: u8 = 0xF4;
const TRUE: u8 = 0xF5;
const NULL: u8 = 0xF6;

/// Decoding failures. All of them mean the input is not canonical and must
/// not be trusted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum DecodeError {
    /// Input ended inside an item
    #[error("unexpected end of input at byte {offset}")]
    #[diagnostic(code(codec::eof))]
    UnexpectedEof {
        /// Offset where more bytes were needed
        offset: usize,
    },

    /// Additional-information value 28..=30
    #[error("reserved additional information {info} at byte {offset}")]
    #[diagnostic(code(codec::reserved))]
    Reserved {
        /// The reserved value
        info: u8,
        /// Offset of the item header
        offset: usize,
    },

    /// Indefinite-length string, array or map, or a stray break
    #[error("indefinite-length item at byte {offset}")]
    #[diagnostic(
        code(codec::indefinite),
        help("canonical objects only use definite lengths")
    )]
    IndefiniteLength {
        /// Offset of the item header
        offset: usize,
    },

    /// Integer or length encoded wider than necessary
    #[error("non-minimal integer encoding at byte {offset}")]
    #[diagnostic(code(codec::non_minimal))]
    NonMinimal {
        /// Offset of the item header
        offset: usize,
    },

    /// Float, undefined or simple value
    #[error("unsupported simple value or float (0x{byte:02x}) at byte {offset}")]
    #[diagnostic(code(codec::unsupported_simple))]
    UnsupportedSimple {
        /// The header byte
        byte: u8,
        /// Offset of the item header
        offset: usize,
    },

    /// Tag other than 42
    #[error("unsupported tag {tag} at byte {offset}")]
    #[diagnostic(code(codec::unsupported_tag))]
    UnsupportedTag {
        /// The tag number
        tag: u64,
        /// Offset of the tag header
        offset: usize,
    },

    /// Tag 42 payload was not a valid CID byte string
    #[error("invalid link at byte {offset}")]
    #[diagnostic(code(codec::invalid_link))]
    InvalidLink {
        /// Offset of the link payload
        offset: usize,
        /// CID parse failure, if the payload was a byte string
        #[source]
        source: Option<CidError>,
    },

    /// Map key that is not a text string
    #[error("map key at byte {offset} is not a text string")]
    #[diagnostic(code(codec::key_type))]
    NonTextKey {
        /// Offset of the key
        offset: usize,
    },

    /// The same key twice in one map
    #[error("duplicate map key {key:?}")]
    #[diagnostic(code(codec::duplicate_key))]
    DuplicateKey {
        /// Repeated key
        key: SmolStr,
    },

    /// Keys not in canonical order
    #[error("map key {key:?} out of canonical order (after {previous:?})")]
    #[diagnostic(
        code(codec::key_order),
        help("keys must be sorted shortest first, then bytewise")
    )]
    KeyOrder {
        /// Key that arrived too late
        key: SmolStr,
        /// Key before it
        previous: SmolStr,
    },

    /// Text string that is not UTF-8
    #[error("invalid UTF-8 in text string at byte {offset}")]
    #[diagnostic(code(codec::utf8))]
    InvalidUtf8 {
        /// Offset of the string payload
        offset: usize,
    },

    /// Nesting deeper than the configured limit
    #[error("nesting exceeds depth limit {limit}")]
    #[diagnostic(code(codec::depth))]
    DepthLimit {
        /// Configured limit
        limit: usize,
    },

    /// Bytes left after the top-level item
    #[error("{remaining} trailing bytes after value")]
    #[diagnostic(code(codec::trailing))]
    TrailingBytes {
        /// Count of unread bytes
        remaining: usize,
    },
}

/// Decoder settings.
///
/// The default is strict: only tagged links are links.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, serde::Serialize, serde::Deserialize)]
#[builder(start_fn = new)]
#[serde(default, rename_all = "camelCase")]
pub struct DecodeOptions {
    /// Accept untagged byte strings that parse as a CID as links.
    ///
    /// Compatibility mode for legacy encoders that dropped tag 42. Off by
    /// default, since it makes a byte string and a link with the same bytes
    /// indistinguishable.
    #[builder(default)]
    pub lenient_links: bool,

    /// Maximum nesting of arrays and maps
    #[builder(default = 64)]
    pub max_depth: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self::new().build()
    }
}

/// Encode a value canonically.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Encode a value canonically, appending to `out`.
pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(NULL),
        Value::Bool(false) => out.push(FALSE),
        Value::Bool(true) => out.push(TRUE),
        Value::Unsigned(n) => write_header(out, MAJOR_UNSIGNED, *n),
        Value::Negative(n) => write_header(out, MAJOR_NEGATIVE, *n),
        Value::Bytes(b) => {
            write_header(out, MAJOR_BYTES, b.len() as u64);
            out.extend_from_slice(b);
        }
        Value::Text(s) => write_text(out, s),
        Value::Array(items) => {
            write_header(out, MAJOR_ARRAY, items.len() as u64);
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Map(map) => encode_map(map, out),
        Value::Link(cid) => encode_link(cid, out),
    }
}

fn encode_map(map: &Map, out: &mut Vec<u8>) {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| canonical_key_cmp(a, b));
    write_header(out, MAJOR_MAP, entries.len() as u64);
    for (key, value) in entries {
        write_text(out, key);
        encode_into(value, out);
    }
}

fn encode_link(cid: &IpldCid, out: &mut Vec<u8>) {
    write_header(out, MAJOR_TAG, LINK_TAG);
    let mut payload = Vec::with_capacity(crate::cid::CID_LEN + 1);
    // multibase identity prefix
    payload.push(0x00);
    write_cid_bytes(cid, &mut payload);
    write_header(out, MAJOR_BYTES, payload.len() as u64);
    out.extend_from_slice(&payload);
}

fn write_text(out: &mut Vec<u8>, s: &str) {
    write_header(out, MAJOR_TEXT, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

fn write_header(out: &mut Vec<u8>, major: u8, arg: u64) {
    let major = major << 5;
    if arg < 24 {
        out.push(major | arg as u8);
    } else if arg <= u8::MAX as u64 {
        out.push(major | 24);
        out.push(arg as u8);
    } else if arg <= u16::MAX as u64 {
        out.push(major | 25);
        out.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= u32::MAX as u64 {
        out.push(major | 26);
        out.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        out.push(major | 27);
        out.extend_from_slice(&arg.to_be_bytes());
    }
}

/// Decode a complete canonical object with default (strict) options.
pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    decode_with(bytes, &DecodeOptions::default())
}

/// Decode a complete canonical object.
pub fn decode_with(bytes: &[u8], options: &DecodeOptions) -> Result<Value, DecodeError> {
    let mut decoder = Decoder::new(bytes, options);
    let value = decoder.value(0)?;
    let remaining = bytes.len() - decoder.pos;
    if remaining != 0 {
        return Err(DecodeError::TrailingBytes { remaining });
    }
    Ok(value)
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    options: &'a DecodeOptions,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8], options: &'a DecodeOptions) -> Self {
        Self {
            input,
            pos: 0,
            options,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.input.len())
            .ok_or(DecodeError::UnexpectedEof {
                offset: self.input.len(),
            })?;
        let slice = &self.input[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read an item header, returning (major, argument, header offset).
    fn header(&mut self) -> Result<(u8, u64, usize), DecodeError> {
        let offset = self.pos;
        let byte = self.take(1)?[0];
        let major = byte >> 5;
        let info = byte & 0x1F;

        if major == MAJOR_SIMPLE {
            return match byte {
                FALSE | TRUE | NULL => Ok((major, info as u64, offset)),
                0xFF => Err(DecodeError::IndefiniteLength { offset }),
                _ => Err(DecodeError::UnsupportedSimple { byte, offset }),
            };
        }

        let arg = match info {
            0..=23 => info as u64,
            24 => {
                let v = self.take(1)?[0] as u64;
                if v < 24 {
                    return Err(DecodeError::NonMinimal { offset });
                }
                v
            }
            25 => {
                let b = self.take(2)?;
                let v = u16::from_be_bytes([b[0], b[1]]) as u64;
                if v <= u8::MAX as u64 {
                    return Err(DecodeError::NonMinimal { offset });
                }
                v
            }
            26 => {
                let b = self.take(4)?;
                let v = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64;
                if v <= u16::MAX as u64 {
                    return Err(DecodeError::NonMinimal { offset });
                }
                v
            }
            27 => {
                let b = self.take(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                let v = u64::from_be_bytes(buf);
                if v <= u32::MAX as u64 {
                    return Err(DecodeError::NonMinimal { offset });
                }
                v
            }
            28..=30 => return Err(DecodeError::Reserved { info, offset }),
            _ => return Err(DecodeError::IndefiniteLength { offset }),
        };
        Ok((major, arg, offset))
    }

    fn length(&self, arg: u64) -> Result<usize, DecodeError> {
        // anything longer than the rest of the input is truncated anyway
        let remaining = self.input.len() - self.pos;
        usize::try_from(arg)
            .ok()
            .filter(|len| *len <= remaining)
            .ok_or(DecodeError::UnexpectedEof {
                offset: self.input.len(),
            })
    }

    fn nest(&self, depth: usize) -> Result<usize, DecodeError> {
        if depth >= self.options.max_depth {
            return Err(DecodeError::DepthLimit {
                limit: self.options.max_depth,
            });
        }
        Ok(depth + 1)
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        let (major, arg, offset) = self.header()?;
        match major {
            MAJOR_UNSIGNED => Ok(Value::Unsigned(arg)),
            MAJOR_NEGATIVE => Ok(Value::Negative(arg)),
            MAJOR_BYTES => {
                let len = self.length(arg)?;
                let bytes = self.take(len)?;
                if self.options.lenient_links {
                    if let Some(cid) = sniff_link(bytes) {
                        return Ok(Value::Link(cid));
                    }
                }
                Ok(Value::Bytes(Bytes::copy_from_slice(bytes)))
            }
            MAJOR_TEXT => Ok(Value::Text(self.text(arg)?)),
            MAJOR_ARRAY => {
                let inner = self.nest(depth)?;
                // every item takes at least one byte
                let len = self.length(arg)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.value(inner)?);
                }
                Ok(Value::Array(items))
            }
            MAJOR_MAP => self.map(arg, depth),
            MAJOR_TAG => {
                if arg != LINK_TAG {
                    return Err(DecodeError::UnsupportedTag { tag: arg, offset });
                }
                self.link().map(Value::Link)
            }
            _ => match arg as u8 {
                // header() only lets false/true/null through for major 7
                20 => Ok(Value::Bool(false)),
                21 => Ok(Value::Bool(true)),
                _ => Ok(Value::Null),
            },
        }
    }

    fn text(&mut self, arg: u64) -> Result<SmolStr, DecodeError> {
        let len = self.length(arg)?;
        let offset = self.pos;
        let raw = self.take(len)?;
        let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8 { offset })?;
        Ok(SmolStr::new(s))
    }

    fn map(&mut self, arg: u64, depth: usize) -> Result<Value, DecodeError> {
        let inner = self.nest(depth)?;
        // every entry takes at least two bytes
        let len = self.length(arg.saturating_mul(2))? / 2;
        let mut map = Map::new();
        let mut previous: Option<SmolStr> = None;
        for _ in 0..len {
            let (major, key_arg, key_offset) = self.header()?;
            if major != MAJOR_TEXT {
                return Err(DecodeError::NonTextKey { offset: key_offset });
            }
            let key = self.text(key_arg)?;
            if let Some(prev) = &previous {
                match canonical_key_cmp(prev, &key) {
                    Ordering::Less => {}
                    Ordering::Equal => return Err(DecodeError::DuplicateKey { key }),
                    Ordering::Greater => {
                        return Err(DecodeError::KeyOrder {
                            key,
                            previous: prev.clone(),
                        });
                    }
                }
            }
            let value = self.value(inner)?;
            previous = Some(key.clone());
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }

    fn link(&mut self) -> Result<IpldCid, DecodeError> {
        let (major, arg, offset) = self.header()?;
        if major != MAJOR_BYTES {
            return Err(DecodeError::InvalidLink {
                offset,
                source: None,
            });
        }
        let len = self.length(arg)?;
        let payload = self.take(len)?;
        match payload.split_first() {
            Some((0x00, cid_bytes)) => {
                parse_cid_bytes(cid_bytes).map_err(|e| DecodeError::InvalidLink {
                    offset,
                    source: Some(e),
                })
            }
            _ => Err(DecodeError::InvalidLink {
                offset,
                source: None,
            }),
        }
    }
}

/// Best-effort link recognition for untagged byte strings.
fn sniff_link(bytes: &[u8]) -> Option<IpldCid> {
    let body = match bytes.split_first() {
        Some((0x00, rest)) => rest,
        _ => bytes,
    };
    parse_cid_bytes(body).ok()
}

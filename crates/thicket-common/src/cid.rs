//! Content identifiers for repository blocks.
//!
//! Every block in a repository is addressed by a CIDv1 whose multihash is the
//! SHA-256 digest of the block's canonical bytes. The binary form is
//! `version || codec || hash-code || digest-len || digest` (all varints except
//! the digest), the text form is multibase base32-lower with the `b` prefix.

use crate::varint::{decode_uvarint, encode_uvarint};
use sha2::{Digest, Sha256};

pub use cid::Cid as IpldCid;

/// DAG-CBOR codec identifier for CIDs (0x71)
pub const DAG_CBOR: u64 = 0x71;

/// Raw codec identifier (0x55), used by blob links
pub const RAW: u64 = 0x55;

/// SHA-256 multihash code
pub const SHA2_256: u64 = 0x12;

/// Digest length for [`SHA2_256`]
pub const SHA2_256_LEN: usize = 32;

/// Encoded length of every CID this crate accepts.
pub const CID_LEN: usize = 4 + SHA2_256_LEN;

/// base 32
pub const CID_BASE: multibase::Base = multibase::Base::Base32Lower;

/// CID parsing and construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum CidError {
    /// Text form did not start with the base32-lower multibase prefix
    #[error("expected multibase prefix 'b', got {0:?}")]
    #[diagnostic(
        code(cid::multibase_prefix),
        help("CIDs are written in lowercase base32 with a leading 'b'")
    )]
    MultibasePrefix(Option<char>),

    /// Body of the text form was not valid base32
    #[error("invalid base32 in CID text: {0}")]
    #[diagnostic(code(cid::base32))]
    Base32(String),

    /// A varint in the binary form was truncated or malformed
    #[error("malformed varint in CID at byte {offset}")]
    #[diagnostic(code(cid::varint))]
    Varint {
        /// Offset of the bad varint
        offset: usize,
    },

    /// CID version other than 1
    #[error("unsupported CID version {0}")]
    #[diagnostic(code(cid::version))]
    UnsupportedVersion(u64),

    /// Content codec other than DAG-CBOR or raw
    #[error("unsupported CID codec 0x{0:x}")]
    #[diagnostic(code(cid::codec))]
    UnsupportedCodec(u64),

    /// Hash function other than SHA-256
    #[error("unsupported multihash code 0x{0:x}")]
    #[diagnostic(code(cid::hash))]
    UnsupportedHash(u64),

    /// Digest length field or digest bytes did not match SHA-256
    #[error("wrong digest length: expected {expected}, got {got}")]
    #[diagnostic(code(cid::digest_length))]
    DigestLength {
        /// Required digest length
        expected: usize,
        /// Length found
        got: usize,
    },

    /// Bytes left after a complete CID
    #[error("{0} trailing bytes after CID")]
    #[diagnostic(code(cid::trailing))]
    TrailingBytes(usize),

    /// The multihash could not be constructed
    #[error("multihash error: {0}")]
    #[diagnostic(code(cid::multihash))]
    Multihash(String),
}

/// Compute the CID of canonical block bytes.
///
/// Uses SHA-256 and the DAG-CBOR codec.
pub fn compute_cid(data: &[u8]) -> Result<IpldCid, CidError> {
    let digest = Sha256::digest(data);
    cid_from_digest(DAG_CBOR, &digest)
}

/// Build a CIDv1 from a codec and a precomputed SHA-256 digest.
pub fn cid_from_digest(codec: u64, digest: &[u8]) -> Result<IpldCid, CidError> {
    if digest.len() != SHA2_256_LEN {
        return Err(CidError::DigestLength {
            expected: SHA2_256_LEN,
            got: digest.len(),
        });
    }
    let mh = multihash::Multihash::<64>::wrap(SHA2_256, digest)
        .map_err(|e| CidError::Multihash(e.to_string()))?;
    Ok(IpldCid::new_v1(codec, mh))
}

/// Recompute the digest of `data` and compare it against `cid`.
///
/// This is an integrity check, not a secret comparison, so it is not
/// constant-time.
pub fn verify_cid(cid: &IpldCid, data: &[u8]) -> bool {
    let hash = cid.hash();
    if hash.code() != SHA2_256 || hash.size() as usize != SHA2_256_LEN {
        return false;
    }
    hash.digest() == &Sha256::digest(data)[..]
}

/// Render a CID in its base32-lower text form.
pub fn cid_to_string(cid: &IpldCid) -> String {
    multibase::encode(CID_BASE, cid.to_bytes())
}

/// Parse the base32 text form of a CID.
pub fn parse_cid_str(s: &str) -> Result<IpldCid, CidError> {
    let first = s.chars().next();
    if first != Some('b') {
        return Err(CidError::MultibasePrefix(first));
    }
    let (base, bytes) = multibase::decode(s).map_err(|e| CidError::Base32(e.to_string()))?;
    if base != CID_BASE {
        return Err(CidError::MultibasePrefix(first));
    }
    parse_cid_bytes(&bytes)
}

/// Parse a binary CID that must occupy all of `bytes`.
pub fn parse_cid_bytes(bytes: &[u8]) -> Result<IpldCid, CidError> {
    let (cid, used) = read_cid_prefix(bytes)?;
    if used != bytes.len() {
        return Err(CidError::TrailingBytes(bytes.len() - used));
    }
    Ok(cid)
}

/// Parse a binary CID from the front of `bytes`.
///
/// Returns the CID and how many bytes it occupied. CIDs are self-delimiting,
/// which is what lets CARv1 sections carry a single length prefix.
pub fn read_cid_prefix(bytes: &[u8]) -> Result<(IpldCid, usize), CidError> {
    let mut offset = 0;
    let next = |offset: &mut usize| -> Result<u64, CidError> {
        let (value, len) =
            decode_uvarint(&bytes[*offset..]).ok_or(CidError::Varint { offset: *offset })?;
        *offset += len;
        Ok(value)
    };

    let version = next(&mut offset)?;
    if version != 1 {
        return Err(CidError::UnsupportedVersion(version));
    }
    let codec = next(&mut offset)?;
    if codec != DAG_CBOR && codec != RAW {
        return Err(CidError::UnsupportedCodec(codec));
    }
    let hash_code = next(&mut offset)?;
    if hash_code != SHA2_256 {
        return Err(CidError::UnsupportedHash(hash_code));
    }
    let digest_len = next(&mut offset)? as usize;
    if digest_len != SHA2_256_LEN {
        return Err(CidError::DigestLength {
            expected: SHA2_256_LEN,
            got: digest_len,
        });
    }
    let digest = bytes
        .get(offset..offset + digest_len)
        .ok_or(CidError::DigestLength {
            expected: SHA2_256_LEN,
            got: bytes.len() - offset,
        })?;
    let cid = cid_from_digest(codec, digest)?;
    Ok((cid, offset + digest_len))
}

/// Write the binary form of `cid` into `out`.
///
/// Equivalent to `cid.to_bytes()` without the intermediate allocation.
pub fn write_cid_bytes(cid: &IpldCid, out: &mut Vec<u8>) {
    let hash = cid.hash();
    encode_uvarint(1, out);
    encode_uvarint(cid.codec(), out);
    encode_uvarint(hash.code(), out);
    encode_uvarint(hash.size() as u64, out);
    out.extend_from_slice(hash.digest());
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_NODE_CID: &str = "bafyreie5737gdxlw5i64vzichcalba3z2v5n6icifvx5xytvske7mr3hpm";

    #[test]
    fn compute_known_cid() {
        // canonical encoding of an empty MST node {"e": [], "l": null}
        let bytes = hex::decode("a2616580616cf6").unwrap();
        let cid = compute_cid(&bytes).unwrap();
        assert_eq!(cid_to_string(&cid), EMPTY_NODE_CID);
        assert_eq!(cid.codec(), DAG_CBOR);
        assert_eq!(cid.to_bytes().len(), CID_LEN);
    }

    #[test]
    fn text_round_trip() {
        let cid = parse_cid_str(EMPTY_NODE_CID).unwrap();
        assert_eq!(cid_to_string(&cid), EMPTY_NODE_CID);
        assert_eq!(cid.to_string(), EMPTY_NODE_CID);
    }

    #[test]
    fn binary_matches_cid_crate() {
        let cid = compute_cid(b"hello").unwrap();
        let mut ours = Vec::new();
        write_cid_bytes(&cid, &mut ours);
        assert_eq!(ours, cid.to_bytes());
        assert_eq!(parse_cid_bytes(&ours).unwrap(), cid);
    }

    #[test]
    fn verify_detects_bit_flips() {
        let data = b"some canonical block".to_vec();
        let cid = compute_cid(&data).unwrap();
        assert!(verify_cid(&cid, &data));

        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[byte] ^= 1 << bit;
                assert!(!verify_cid(&cid, &flipped), "flip {byte}:{bit} not detected");
            }
        }
    }

    #[test]
    fn rejects_wrong_multibase() {
        let upper = EMPTY_NODE_CID.replacen('b', "B", 1);
        assert!(matches!(
            parse_cid_str(&upper),
            Err(CidError::MultibasePrefix(Some('B')))
        ));
        assert!(matches!(
            parse_cid_str(""),
            Err(CidError::MultibasePrefix(None))
        ));
        assert!(matches!(parse_cid_str("b!!!"), Err(CidError::Base32(_))));
    }

    #[test]
    fn rejects_unsupported_tags() {
        let cid = compute_cid(b"x").unwrap();
        let good = cid.to_bytes();

        let mut bad_version = good.clone();
        bad_version[0] = 0x02;
        assert_eq!(
            parse_cid_bytes(&bad_version),
            Err(CidError::UnsupportedVersion(2))
        );

        let mut bad_codec = good.clone();
        bad_codec[1] = 0x70;
        assert_eq!(
            parse_cid_bytes(&bad_codec),
            Err(CidError::UnsupportedCodec(0x70))
        );

        let mut bad_hash = good.clone();
        bad_hash[2] = 0x13;
        assert_eq!(
            parse_cid_bytes(&bad_hash),
            Err(CidError::UnsupportedHash(0x13))
        );

        let mut bad_len = good.clone();
        bad_len[3] = 0x10;
        assert!(matches!(
            parse_cid_bytes(&bad_len),
            Err(CidError::DigestLength { expected: 32, got: 16 })
        ));

        assert!(matches!(
            parse_cid_bytes(&good[..20]),
            Err(CidError::DigestLength { .. })
        ));

        let mut trailing = good.clone();
        trailing.push(0);
        assert_eq!(parse_cid_bytes(&trailing), Err(CidError::TrailingBytes(1)));
    }

    #[test]
    fn prefix_reports_length() {
        let cid = compute_cid(b"abc").unwrap();
        let mut bytes = cid.to_bytes();
        bytes.extend_from_slice(b"block payload");
        let (parsed, used) = read_cid_prefix(&bytes).unwrap();
        assert_eq!(parsed, cid);
        assert_eq!(used, CID_LEN);
    }
}

//! Unsigned LEB128 varints, as used by multiformats and CAR framing.

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the varint encoding of `value` to `out`.
pub fn encode_uvarint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Number of bytes `value` takes when varint encoded.
pub fn uvarint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Decode a varint from the start of `data`.
///
/// Returns the value and the number of bytes consumed. `None` if the input is
/// truncated, overflows a `u64`, or is not minimally encoded (a trailing
/// `0x00` continuation byte).
pub fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for (i, b) in data.iter().copied().enumerate() {
        if b < 0x80 {
            if i > 9 || (i == 9 && b > 1) {
                return None;
            }
            if i > 0 && b == 0 {
                return None;
            }
            return Some((x | ((b as u64) << s), i + 1));
        }
        if i >= MAX_VARINT_LEN - 1 {
            return None;
        }
        x |= ((b & 0x7F) as u64) << s;
        s += 7;
    }
    None
}

/// Incremental varint decoder for byte-at-a-time readers.
///
/// Feed bytes with [`VarintAccumulator::push`] until it yields a value.
#[derive(Debug, Default, Clone)]
pub struct VarintAccumulator {
    value: u64,
    shift: u32,
    count: usize,
}

/// Varint decoding failure for [`VarintAccumulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum VarintError {
    /// More than ten bytes or a value beyond `u64::MAX`
    #[error("varint overflows u64")]
    Overflow,
    /// Last byte was zero after a continuation byte
    #[error("varint is not minimally encoded")]
    NonMinimal,
}

impl VarintAccumulator {
    /// Start a fresh decode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes consumed so far.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether no byte has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Push one byte; returns the decoded value once the final byte arrives.
    pub fn push(&mut self, byte: u8) -> Result<Option<u64>, VarintError> {
        let index = self.count;
        self.count += 1;
        if byte < 0x80 {
            if index > 9 || (index == 9 && byte > 1) {
                return Err(VarintError::Overflow);
            }
            if index > 0 && byte == 0 {
                return Err(VarintError::NonMinimal);
            }
            return Ok(Some(self.value | ((byte as u64) << self.shift)));
        }
        if index >= MAX_VARINT_LEN - 1 {
            return Err(VarintError::Overflow);
        }
        self.value |= ((byte & 0x7F) as u64) << self.shift;
        self.shift += 7;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode_uvarint(v, &mut out);
        out
    }

    #[test]
    fn known_encodings() {
        assert_eq!(enc(0), vec![0x00]);
        assert_eq!(enc(1), vec![0x01]);
        assert_eq!(enc(127), vec![0x7F]);
        assert_eq!(enc(128), vec![0x80, 0x01]);
        assert_eq!(enc(300), vec![0xAC, 0x02]);
        assert_eq!(enc(0x71), vec![0x71]);
        assert_eq!(enc(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn lengths_match_encoding() {
        for v in [0, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            assert_eq!(uvarint_len(v), enc(v).len(), "value {v}");
        }
    }

    #[test]
    fn decode_reports_consumed() {
        assert_eq!(decode_uvarint(&[0xAC, 0x02, 0xFF]), Some((300, 2)));
        assert_eq!(decode_uvarint(&enc(u64::MAX)), Some((u64::MAX, 10)));
    }

    #[test]
    fn decode_rejects_bad_input() {
        // truncated
        assert_eq!(decode_uvarint(&[0x80]), None);
        assert_eq!(decode_uvarint(&[]), None);
        // non-minimal
        assert_eq!(decode_uvarint(&[0x81, 0x00]), None);
        // overflow
        assert_eq!(
            decode_uvarint(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02]),
            None
        );
    }

    #[test]
    fn accumulator_matches_slice_decoder() {
        for v in [0, 5, 128, 300, 1 << 40, u64::MAX] {
            let bytes = enc(v);
            let mut acc = VarintAccumulator::new();
            let mut out = None;
            for b in &bytes {
                out = acc.push(*b).unwrap();
            }
            assert_eq!(out, Some(v));
            assert_eq!(acc.len(), bytes.len());
        }

        let mut acc = VarintAccumulator::new();
        assert_eq!(acc.push(0x80), Ok(None));
        assert_eq!(acc.push(0x00), Err(VarintError::NonMinimal));
    }
}

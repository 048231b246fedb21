//! Generic data model for canonical objects.
//!
//! [`Value`] covers exactly what the canonical codec can express: integers,
//! byte strings, text, arrays, text-keyed maps, booleans, null and CID links.
//! There are no floats.

use crate::cid::IpldCid;
use bytes::Bytes;
use smol_str::SmolStr;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Text-keyed map of values.
///
/// Iteration order of the `BTreeMap` is plain string order; the encoder
/// re-sorts into canonical order, so two maps holding the same pairs always
/// encode identically.
pub type Map = BTreeMap<SmolStr, Value>;

/// A canonical object value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `null`
    Null,
    /// `true` / `false`
    Bool(bool),
    /// Non-negative integer
    Unsigned(u64),
    /// Negative integer, stored as its CBOR argument: the value is `-1 - n`
    Negative(u64),
    /// Byte string
    Bytes(Bytes),
    /// UTF-8 text string
    Text(SmolStr),
    /// Ordered array
    Array(Vec<Value>),
    /// Map with unique text keys
    Map(Map),
    /// Content-addressed link (CBOR tag 42)
    Link(IpldCid),
}

impl Value {
    /// Build an integer value from an `i64`.
    pub fn int(v: i64) -> Self {
        if v >= 0 {
            Value::Unsigned(v as u64)
        } else {
            Value::Negative(!(v as u64))
        }
    }

    /// Build a text value.
    pub fn text(s: impl AsRef<str>) -> Self {
        Value::Text(SmolStr::new(s))
    }

    /// Build a byte string value.
    pub fn bytes(b: impl Into<Bytes>) -> Self {
        Value::Bytes(b.into())
    }

    /// Build a map value from key/value pairs. Later duplicates win.
    pub fn map<K: Into<SmolStr>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Unsigned(_) | Value::Negative(_) => "integer",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Link(_) => "link",
        }
    }

    /// Check for `null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer as `i64`, if in range
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Unsigned(n) => i64::try_from(n).ok(),
            Value::Negative(n) => i64::try_from(n).ok().map(|n| -1 - n),
            _ => None,
        }
    }

    /// Non-negative integer as `u64`
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Unsigned(n) => Some(n),
            _ => None,
        }
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Text payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Byte string payload
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Link payload
    pub fn as_link(&self) -> Option<&IpldCid> {
        match self {
            Value::Link(c) => Some(c),
            _ => None,
        }
    }

    /// Array payload
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Map payload
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a field if this is a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// The `$type` discriminator of a record, if present as text.
    pub fn record_type(&self) -> Option<&str> {
        self.get("$type").and_then(Value::as_str)
    }
}

/// Canonical ordering of map keys.
///
/// Keys are ordered by their encoded CBOR form, byte by byte. The text header
/// carries the length, so shorter keys sort first and equal-length keys sort
/// bytewise.
pub fn canonical_key_cmp(a: &str, b: &str) -> Ordering {
    a.len()
        .cmp(&b.len())
        .then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Unsigned(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::text(s)
    }
}

impl From<SmolStr> for Value {
    fn from(s: SmolStr) -> Self {
        Value::Text(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<IpldCid> for Value {
    fn from(c: IpldCid) -> Self {
        Value::Link(c)
    }
}

impl From<Option<IpldCid>> for Value {
    fn from(c: Option<IpldCid>) -> Self {
        c.map(Value::Link).unwrap_or(Value::Null)
    }
}

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Value::Array(a)
    }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self {
        Value::Map(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_from_i64() {
        assert_eq!(Value::int(0), Value::Unsigned(0));
        assert_eq!(Value::int(-1), Value::Negative(0));
        assert_eq!(Value::int(-500), Value::Negative(499));
        assert_eq!(Value::int(i64::MIN).as_i64(), Some(i64::MIN));
        assert_eq!(Value::Negative(u64::MAX).as_i64(), None);
        assert_eq!(Value::Unsigned(u64::MAX).as_i64(), None);
    }

    #[test]
    fn key_order_is_length_first() {
        let mut keys = vec!["version", "roots", "sig", "data", "rev", "prev", "a", "aa", "b"];
        keys.sort_by(|a, b| canonical_key_cmp(a, b));
        assert_eq!(
            keys,
            vec!["a", "b", "aa", "rev", "sig", "data", "prev", "roots", "version"]
        );
    }

    #[test]
    fn record_type_lookup() {
        let v = Value::map([
            ("$type", Value::text("app.bsky.feed.post")),
            ("text", Value::text("hi")),
        ]);
        assert_eq!(v.record_type(), Some("app.bsky.feed.post"));
        assert_eq!(Value::Null.record_type(), None);
    }
}

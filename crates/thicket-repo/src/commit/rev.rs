//! Revisions and timestamp identifiers

use smol_str::{SmolStr, SmolStrBuilder};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const S32_CHAR: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

/// Length of a timestamp identifier
pub const TID_LEN: usize = 13;

/// Largest clock identifier that fits in a TID
pub const MAX_CLOCK_ID: u16 = 0x3FF;

fn s32_encode(mut i: u64) -> SmolStr {
    let mut chars = [0u8; TID_LEN];
    for slot in chars.iter_mut().rev() {
        *slot = S32_CHAR[(i & 0x1F) as usize];
        i >>= 5;
    }
    let mut s = SmolStrBuilder::new();
    for c in chars {
        s.push(c as char);
    }
    s.finish()
}

fn s32_decode(s: &str) -> Option<u64> {
    if s.len() != TID_LEN {
        return None;
    }
    s.bytes().try_fold(0u64, |acc, b| {
        let digit = S32_CHAR.iter().position(|c| *c == b)? as u64;
        Some((acc << 5) | digit)
    })
}

fn pack(micros: u64, clock_id: u16) -> u64 {
    // 0TTTTTTTTTTTTTTT TTTTTTTTTTTTTTTT TTTTTTTTTTTTTTTT TTTTTTCCCCCCCCCC
    ((micros << 10) & 0x7FFF_FFFF_FFFF_FC00) | (u64::from(clock_id) & 0x3FF)
}

/// Commit revision
///
/// Revisions order as plain text. Revisions minted here are TIDs: 13
/// characters of sortable base32 over a microsecond timestamp and a clock
/// id, so text order is time order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Revision(SmolStr);

impl Revision {
    /// Wrap an existing revision string
    pub fn new(rev: impl Into<SmolStr>) -> Self {
        Self(rev.into())
    }

    /// TID for the given time and clock id (only the low 10 bits are used)
    pub fn from_datetime(clock_id: u16, time: chrono::DateTime<chrono::Utc>) -> Self {
        let micros = u64::try_from(time.timestamp_micros()).unwrap_or(0);
        Self(s32_encode(pack(micros, clock_id)))
    }

    /// TID for the current time
    pub fn now(clock_id: u16) -> Self {
        Self::from_datetime(clock_id, chrono::Utc::now())
    }

    /// Returns the revision as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this revision is a well-formed TID
    pub fn is_tid(&self) -> bool {
        self.tid_value().is_some()
    }

    /// Timestamp encoded in a TID revision
    pub fn timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let micros = i64::try_from(self.tid_value()? >> 10).ok()?;
        chrono::DateTime::from_timestamp_micros(micros)
    }

    /// Clock id encoded in a TID revision
    pub fn clock_id(&self) -> Option<u16> {
        self.tid_value().map(|v| (v & 0x3FF) as u16)
    }

    fn tid_value(&self) -> Option<u64> {
        // the top bit must stay clear, which limits the first character
        match self.0.as_bytes().first() {
            Some(b'2'..=b'7' | b'a'..=b'j') => s32_decode(&self.0),
            _ => None,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Revision {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<&str> for Revision {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Revision> for SmolStr {
    fn from(value: Revision) -> Self {
        value.0
    }
}

/// Source of strictly increasing TID revisions
///
/// Two calls within the same microsecond (or after the wall clock steps
/// back) still produce distinct, ascending revisions.
#[derive(Debug)]
pub struct TidClock {
    clock_id: u16,
    last: AtomicU64,
}

impl TidClock {
    /// Clock with the given id (only the low 10 bits are used)
    pub fn new(clock_id: u16) -> Self {
        Self {
            clock_id: clock_id & MAX_CLOCK_ID,
            last: AtomicU64::new(0),
        }
    }

    /// Next revision, strictly after every one this clock returned before
    pub fn next(&self) -> Revision {
        let now = u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let micros = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, micros, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Revision(s32_encode(pack(micros, self.clock_id))),
                Err(actual) => prev = actual,
            }
        }
    }
}

impl Default for TidClock {
    fn default() -> Self {
        Self::new(0)
    }
}

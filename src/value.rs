//! Typed values exchanged through the queue and map.
//!
//! Payloads are opaque bytes unless the producer chose the vector form, in
//! which case the payload is a sequence of typed segments, each stored as a
//! `[type | byte length | data padded to a slot]` group. The same wire form
//! is used by the queue's vector add and the map's vector cells.

use crate::error::Error;
use crate::pr;

/// Data types a value or segment can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ValueKind {
    /// Tuple of multiple types.
    Tuple = 0,
    /// Unspecified byte object.
    Object = 1,
    /// Integer, width given by the length.
    Integer = 2,
    /// Floating point, width given by the length.
    Float = 3,
    /// ASCII string.
    Ascii = 4,
    /// UTF-8 string.
    Utf8 = 5,
    /// Key/value pairs.
    Dict = 6,
    /// JSON document.
    Json = 7,
    /// XML document.
    Xml = 8,
}

impl ValueKind {
    pub(crate) fn from_code(code: i64) -> Result<ValueKind, Error> {
        Ok(match code {
            0 => ValueKind::Tuple,
            1 => ValueKind::Object,
            2 => ValueKind::Integer,
            3 => ValueKind::Float,
            4 => ValueKind::Ascii,
            5 => ValueKind::Utf8,
            6 => ValueKind::Dict,
            7 => ValueKind::Json,
            8 => ValueKind::Xml,
            _ => return Err(Error::State),
        })
    }
}

/// One typed segment of a vector value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Declared type of the segment.
    pub kind: ValueKind,
    /// Segment payload.
    pub bytes: Vec<u8>,
}

impl Segment {
    /// Construct a segment.
    pub fn new(kind: ValueKind, bytes: impl Into<Vec<u8>>) -> Segment {
        Segment {
            kind,
            bytes: bytes.into(),
        }
    }
}

/// Slots needed to store `len` bytes.
#[inline]
pub(crate) fn byte_slots(len: usize) -> i64 {
    ((len + pr::SLOT_BYTES - 1) / pr::SLOT_BYTES) as i64
}

/// Slots needed by the packed form of `segments` (two header slots plus
/// padded data per segment).
pub(crate) fn packed_slots(segments: &[Segment]) -> i64 {
    segments
        .iter()
        .map(|s| 2 + byte_slots(s.bytes.len()))
        .sum()
}

/// Serialize segments into their wire form.
pub(crate) fn pack(segments: &[Segment]) -> Vec<u8> {
    let total = packed_slots(segments) as usize * pr::SLOT_BYTES;
    let mut out = Vec::with_capacity(total);
    for seg in segments {
        out.extend_from_slice(&(seg.kind as i64).to_le_bytes());
        out.extend_from_slice(&(seg.bytes.len() as i64).to_le_bytes());
        out.extend_from_slice(&seg.bytes);
        let pad = total_pad(seg.bytes.len());
        out.extend(std::iter::repeat(0u8).take(pad));
    }
    out
}

#[inline]
fn total_pad(len: usize) -> usize {
    (pr::SLOT_BYTES - len % pr::SLOT_BYTES) % pr::SLOT_BYTES
}

/// Parse `count` packed segments back out of a payload.
pub(crate) fn unpack(bytes: &[u8], count: u32) -> Result<Vec<Segment>, Error> {
    let mut out = Vec::with_capacity(count as usize);
    let mut at = 0usize;
    for _ in 0..count {
        if at + 2 * pr::SLOT_BYTES > bytes.len() {
            return Err(Error::State);
        }
        let kind = i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
        let len = i64::from_le_bytes(bytes[at + 8..at + 16].try_into().unwrap());
        at += 2 * pr::SLOT_BYTES;
        if len < 0 || at + len as usize > bytes.len() {
            return Err(Error::State);
        }
        out.push(Segment {
            kind: ValueKind::from_code(kind)?,
            bytes: bytes[at..at + len as usize].to_vec(),
        });
        at += len as usize + total_pad(len as usize);
    }
    Ok(out)
}

/// Parse packed segments until the payload is exhausted.
pub(crate) fn unpack_all(bytes: &[u8]) -> Result<Vec<Segment>, Error> {
    let mut out = Vec::new();
    let mut at = 0usize;
    while at < bytes.len() {
        if at + 2 * pr::SLOT_BYTES > bytes.len() {
            return Err(Error::State);
        }
        let kind = i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
        let len = i64::from_le_bytes(bytes[at + 8..at + 16].try_into().unwrap());
        at += 2 * pr::SLOT_BYTES;
        if len < 0 || at + len as usize > bytes.len() {
            return Err(Error::State);
        }
        out.push(Segment {
            kind: ValueKind::from_code(kind)?,
            bytes: bytes[at..at + len as usize].to_vec(),
        });
        at += len as usize + total_pad(len as usize);
    }
    Ok(out)
}

/// A `CLOCK_REALTIME` instant stored as two slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    /// Whole seconds.
    pub sec: i64,
    /// Nanosecond remainder.
    pub nsec: i64,
}

impl Timespec {
    /// Current wall-clock time.
    pub fn now() -> Timespec {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        Timespec {
            sec: ts.tv_sec,
            nsec: ts.tv_nsec,
        }
    }

    /// True when either field is set.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.sec != 0 || self.nsec != 0
    }

    /// Difference `self - other`, normalized.
    pub fn diff(&self, other: &Timespec) -> Timespec {
        let mut sec = self.sec - other.sec;
        let mut nsec = self.nsec - other.nsec;
        if nsec < 0 {
            sec -= 1;
            nsec += 1_000_000_000;
        }
        Timespec { sec, nsec }
    }
}

impl PartialOrd for Timespec {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timespec {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.sec, self.nsec).cmp(&(other.sec, other.nsec))
    }
}

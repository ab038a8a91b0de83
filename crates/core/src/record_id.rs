//! Record addressing
//!
//! A `RecordId` is the stable `(cluster, position)` address of a persisted
//! record. Documents that have never been saved carry no `RecordId`; the
//! address is assigned on first save and never reused afterwards.
//!
//! Records refer to each other only through `RecordId` handles that are
//! resolved through the record store, never through direct references.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Encoded width of a `RecordId` in bytes
pub const RECORD_ID_BYTES: usize = 12;

/// Stable address of a persisted record
///
/// Ordering is by cluster first, then position, which is also the ordering
/// of the big-endian byte encoding produced by [`RecordId::to_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    /// Cluster the record lives in (one cluster per class)
    pub cluster: i32,
    /// Position within the cluster
    pub position: i64,
}

impl RecordId {
    /// Create a record id
    pub const fn new(cluster: i32, position: i64) -> Self {
        RecordId { cluster, position }
    }

    /// Smallest possible id, used as an open lower bound
    pub const MIN: RecordId = RecordId::new(i32::MIN, i64::MIN);

    /// Largest possible id, used as an open upper bound
    pub const MAX: RecordId = RecordId::new(i32::MAX, i64::MAX);

    /// Order-preserving byte encoding
    ///
    /// The sign bit of each part is flipped so that unsigned byte comparison
    /// agrees with `Ord`.
    pub fn to_bytes(&self) -> [u8; RECORD_ID_BYTES] {
        let mut buf = [0u8; RECORD_ID_BYTES];
        BigEndian::write_u32(&mut buf[0..4], (self.cluster as u32) ^ 0x8000_0000);
        BigEndian::write_u64(&mut buf[4..12], (self.position as u64) ^ 0x8000_0000_0000_0000);
        buf
    }

    /// Decode from [`RecordId::to_bytes`] output
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_ID_BYTES {
            return None;
        }
        let cluster = (BigEndian::read_u32(&bytes[0..4]) ^ 0x8000_0000) as i32;
        let position = (BigEndian::read_u64(&bytes[4..12]) ^ 0x8000_0000_0000_0000) as i64;
        Some(RecordId { cluster, position })
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix('#')
            .ok_or_else(|| Error::validation(format!("record id '{}' must start with '#'", s)))?;
        let (cluster, position) = body
            .split_once(':')
            .ok_or_else(|| Error::validation(format!("record id '{}' must be '#cluster:position'", s)))?;
        let cluster = cluster
            .parse::<i32>()
            .map_err(|e| Error::validation(format!("bad cluster in '{}': {}", s, e)))?;
        let position = position
            .parse::<i64>()
            .map_err(|e| Error::validation(format!("bad position in '{}': {}", s, e)))?;
        Ok(RecordId { cluster, position })
    }
}

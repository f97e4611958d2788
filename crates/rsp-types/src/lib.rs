#![forbid(unsafe_code)]
//! Shared types for RawSpool.
//!
//! Newtype ids for sector addressing, the `ValidPart`/`TransferState` range
//! bookkeeping that describes resumable transfer progress, and little-endian
//! parse helpers used by the on-disk FAT layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed sector size of the block layer, in bytes.
///
/// Every `SectorDevice` implementation must expose exactly this size;
/// constructors reject anything else. Offset→LBA arithmetic throughout the
/// workspace assumes it.
pub const SECTOR_SIZE: usize = 512;

/// Logical unit number identifying a drive on the mass-storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LunNbr(pub u8);

/// Logical block address: a zero-based sector index on the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorNbr(pub u32);

impl SectorNbr {
    /// Add a sector count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, sectors: u32) -> Option<Self> {
        self.0.checked_add(sectors).map(Self)
    }
}

/// Identity of an inserted medium.
///
/// Derived from the volume id combined with a per-plug generation, so two
/// different media — or the same medium across an unplug/replug cycle —
/// never compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediumId(pub u64);

impl fmt::Display for LunNbr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SectorNbr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MediumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

// ── Valid-range bookkeeping ─────────────────────────────────────────────────

/// A closed-open byte interval `[start, end)` known to contain written data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidPart {
    pub start: u64,
    pub end: u64,
}

impl ValidPart {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "ValidPart start must not exceed end");
        Self { start, end }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Union `other` into `self` iff the two ranges overlap or touch.
    ///
    /// Disjoint ranges leave `self` unchanged; ranges are only ever grown.
    pub fn merge(&mut self, other: ValidPart) {
        if other.start <= self.end && other.end >= self.start {
            self.start = self.start.min(other.start);
            self.end = self.end.max(other.end);
        }
    }

    /// Bytes shared between `self` and `other`.
    #[must_use]
    pub fn overlap(&self, other: &ValidPart) -> u64 {
        let lo = self.start.max(other.start);
        let hi = self.end.min(other.end);
        hi.saturating_sub(lo)
    }
}

/// Progress state of a partial file: a valid head growing from byte 0 and a
/// valid tail growing back from the end.
///
/// Serialized by callers to resume a transfer across reboots. On open, the
/// stored `total_size` is overwritten with the actual file size.
///
/// Invariants: `valid_head`, if present, starts at 0; `valid_tail`, if
/// present, ends at `total_size`; the two are disjoint until they meet, at
/// which point both hold the same unified range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub total_size: u64,
    pub valid_head: Option<ValidPart>,
    pub valid_tail: Option<ValidPart>,
}

impl TransferState {
    #[must_use]
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            valid_head: None,
            valid_tail: None,
        }
    }

    /// Integer-truncated percentage of the file covered by head + tail.
    ///
    /// Overlap between the two ranges is counted once.
    #[must_use]
    pub fn percent_valid(&self) -> i32 {
        if self.total_size == 0 {
            return 0;
        }
        let head_len = self.valid_head.map_or(0, |p| p.len());
        let tail_len = self.valid_tail.map_or(0, |p| p.len());
        let overlap = match (self.valid_head, self.valid_tail) {
            (Some(head), Some(tail)) => head.overlap(&tail),
            _ => 0,
        };
        let valid = u128::from(head_len + tail_len - overlap);
        i32::try_from(valid * 100 / u128::from(self.total_size)).unwrap_or(0)
    }

    /// True iff the head exists, starts at 0, and covers at least `bytes`.
    #[must_use]
    pub fn has_valid_head(&self, bytes: u64) -> bool {
        self.valid_head
            .is_some_and(|p| p.start == 0 && p.end >= bytes)
    }

    /// True iff the tail exists and covers the last `bytes` of the file.
    #[must_use]
    pub fn has_valid_tail(&self, bytes: u64) -> bool {
        self.valid_tail.is_some_and(|p| {
            p.end == self.total_size && p.start <= self.total_size.saturating_sub(bytes)
        })
    }

    /// True iff head and tail together cover the whole file.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.has_valid_head(self.total_size)
    }
}

// ── Parse helpers ───────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Decode a fixed-width, NUL-padded label field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn merge_unions_overlapping_ranges() {
        let mut part = ValidPart::new(0, 512);
        part.merge(ValidPart::new(256, 1024));
        assert_eq!(part, ValidPart::new(0, 1024));
    }

    #[test]
    fn merge_unions_touching_ranges() {
        let mut part = ValidPart::new(0, 512);
        part.merge(ValidPart::new(512, 1024));
        assert_eq!(part, ValidPart::new(0, 1024));

        let mut part = ValidPart::new(512, 1024);
        part.merge(ValidPart::new(0, 512));
        assert_eq!(part, ValidPart::new(0, 1024));
    }

    #[test]
    fn merge_ignores_disjoint_ranges() {
        let mut part = ValidPart::new(0, 512);
        part.merge(ValidPart::new(1536, 2048));
        assert_eq!(part, ValidPart::new(0, 512));
    }

    #[test]
    fn overlap_counts_shared_bytes() {
        let a = ValidPart::new(0, 1024);
        let b = ValidPart::new(512, 2048);
        assert_eq!(a.overlap(&b), 512);
        assert_eq!(b.overlap(&a), 512);
        assert_eq!(a.overlap(&ValidPart::new(1024, 2048)), 0);
    }

    #[test]
    fn percent_counts_head_and_tail_once() {
        let state = TransferState {
            total_size: 2048,
            valid_head: Some(ValidPart::new(0, 512)),
            valid_tail: Some(ValidPart::new(1536, 2048)),
        };
        assert_eq!(state.percent_valid(), 50);
    }

    #[test]
    fn percent_unified_range_is_not_double_counted() {
        let full = ValidPart::new(0, 2048);
        let state = TransferState {
            total_size: 2048,
            valid_head: Some(full),
            valid_tail: Some(full),
        };
        assert_eq!(state.percent_valid(), 100);
    }

    #[test]
    fn percent_truncates() {
        let state = TransferState {
            total_size: 3000,
            valid_head: Some(ValidPart::new(0, 1000)),
            valid_tail: None,
        };
        // 1000 / 3000 = 33.33..%
        assert_eq!(state.percent_valid(), 33);
    }

    #[test]
    fn percent_of_empty_file_is_zero() {
        assert_eq!(TransferState::new(0).percent_valid(), 0);
    }

    #[test]
    fn has_valid_head_requires_start_at_zero() {
        let mut state = TransferState::new(2048);
        assert!(!state.has_valid_head(1));
        state.valid_head = Some(ValidPart::new(0, 512));
        assert!(state.has_valid_head(512));
        assert!(!state.has_valid_head(513));
    }

    #[test]
    fn has_valid_tail_covers_file_end() {
        let mut state = TransferState::new(2048);
        assert!(!state.has_valid_tail(1));
        state.valid_tail = Some(ValidPart::new(1536, 2048));
        assert!(state.has_valid_tail(512));
        assert!(!state.has_valid_tail(513));
    }

    #[test]
    fn state_round_trips_through_serde() {
        let state = TransferState {
            total_size: 4096,
            valid_head: Some(ValidPart::new(0, 1024)),
            valid_tail: Some(ValidPart::new(3072, 4096)),
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: TransferState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn parse_helpers_reject_short_input() {
        let data = [1_u8, 2, 3];
        assert!(read_le_u32(&data, 0).is_err());
        assert_eq!(read_le_u16(&data, 1).unwrap(), u16::from_le_bytes([2, 3]));
        assert!(matches!(
            ensure_slice(&data, usize::MAX, 2),
            Err(ParseError::InvalidField { .. })
        ));
    }

    proptest! {
        #[test]
        fn merge_never_shrinks(
            a_start in 0_u64..10_000,
            a_len in 0_u64..10_000,
            b_start in 0_u64..10_000,
            b_len in 0_u64..10_000,
        ) {
            let a = ValidPart::new(a_start, a_start + a_len);
            let b = ValidPart::new(b_start, b_start + b_len);
            let mut merged = a;
            merged.merge(b);
            prop_assert!(merged.start <= a.start);
            prop_assert!(merged.end >= a.end);
            prop_assert!(merged.len() >= a.len());
        }

        #[test]
        fn merge_is_commutative_for_connected_ranges(
            a_start in 0_u64..10_000,
            a_len in 1_u64..10_000,
            b_start in 0_u64..10_000,
            b_len in 1_u64..10_000,
        ) {
            let a = ValidPart::new(a_start, a_start + a_len);
            let b = ValidPart::new(b_start, b_start + b_len);
            if b.start <= a.end && b.end >= a.start {
                let mut ab = a;
                ab.merge(b);
                let mut ba = b;
                ba.merge(a);
                prop_assert_eq!(ab, ba);
            }
        }
    }
}

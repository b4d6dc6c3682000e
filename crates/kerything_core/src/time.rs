//! Modification-time semantics per source filesystem.
//!
//! ext4 stores Unix seconds directly; NTFS stores 100-nanosecond ticks
//! since 1601-01-01 UTC. Records keep the raw source value so sorting is
//! consistent within a device; conversion happens at display time.

use crate::types::FsType;

/// Seconds between 1601-01-01 and 1970-01-01.
const NTFS_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// Converts NTFS 100-ns ticks since 1601 to Unix seconds.
pub fn ntfs_ticks_to_unix(ticks: u64) -> i64 {
    (ticks / 10_000_000) as i64 - NTFS_EPOCH_OFFSET_SECS
}

/// How a raw record mtime should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayTime {
    /// Unix seconds.
    Unix(i64),
    /// Source stored zero: "unknown".
    Unknown,
    /// Converted value falls outside a plausible Unix range.
    OutOfRange,
}

/// Interprets a record's raw `modification_time` for display.
///
/// Zero always means "unknown" regardless of source. NTFS values that
/// convert to a negative Unix time (pre-1970 is not plausible for a file
/// table) report [`DisplayTime::OutOfRange`].
pub fn display_mtime(fs_type: FsType, raw: u64) -> DisplayTime {
    if raw == 0 {
        return DisplayTime::Unknown;
    }
    match fs_type {
        FsType::Ext4 => {
            if raw > i64::MAX as u64 {
                DisplayTime::OutOfRange
            } else {
                DisplayTime::Unix(raw as i64)
            }
        }
        FsType::Ntfs => {
            let unix = ntfs_ticks_to_unix(raw);
            if unix < 0 {
                DisplayTime::OutOfRange
            } else {
                DisplayTime::Unix(unix)
            }
        }
    }
}

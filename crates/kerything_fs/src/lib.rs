//! Raw filesystem decoders.
//!
//! Both decoders read on-disk metadata straight from a block device,
//! bypassing the kernel's file layer, and emit the same shape: a packed
//! record table plus a shared string pool ([`kerything_core::payload::ScanPayload`]).

pub mod detect;
pub mod error;
pub mod ext4;
pub mod io;
pub mod ntfs;

pub use error::{DecodeError, Result};
pub use io::{BlockSource, DiskReader};

/// Progress callback: called with `(done, total)` units of decoder-defined
/// work (MFT records for NTFS, inodes for ext4).
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

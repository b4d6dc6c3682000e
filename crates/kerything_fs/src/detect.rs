//! Filesystem-type and display-metadata probing.
//!
//! Reads just enough of a partition to classify it and, for ext4, pull the
//! volume label and filesystem UUID out of the superblock. NTFS label/UUID
//! would require walking `$Volume`; they are reported empty.

use crate::error::Result;
use crate::ext4::{Superblock, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use crate::io::BlockSource;
use kerything_core::types::FsType;

/// What a probe learned about a partition.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub fs_type: Option<FsType>,
    pub label: String,
    pub uuid: String,
}

/// Sniffs the superblock magic of a partition.
pub fn probe<S: BlockSource>(source: &mut S) -> Result<ProbeInfo> {
    let mut boot = [0u8; 512];
    if source.read_exact_at(0, &mut boot).is_ok() && boot[3..11] == *b"NTFS    " {
        return Ok(ProbeInfo {
            fs_type: Some(FsType::Ntfs),
            ..ProbeInfo::default()
        });
    }

    let mut sb_buf = vec![0u8; SUPERBLOCK_SIZE];
    if source.read_exact_at(SUPERBLOCK_OFFSET, &mut sb_buf).is_ok() {
        if let Ok(sb) = Superblock::parse(&sb_buf) {
            return Ok(ProbeInfo {
                fs_type: Some(FsType::Ext4),
                label: trimmed_label(&sb.volume_name),
                uuid: format_uuid(&sb.uuid),
            });
        }
    }

    Ok(ProbeInfo::default())
}

fn trimmed_label(raw: &[u8; 16]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim_end().to_string()
}

fn format_uuid(raw: &[u8; 16]) -> String {
    if raw.iter().all(|&b| b == 0) {
        return String::new();
    }
    let hex: Vec<String> = raw.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        hex[0..4].join(""),
        hex[4..6].join(""),
        hex[6..8].join(""),
        hex[8..10].join(""),
        hex[10..16].join(""),
    )
}

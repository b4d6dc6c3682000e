//! Decoder error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Device or image read failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// First sector does not carry the "NTFS    " marker
    #[error("Bad NTFS OEM id: {0:02X?}")]
    BadOemId([u8; 8]),

    /// Boot-sector parameters compute to nonsense (zero MFT offset or
    /// record size)
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// ext4 superblock failed validation
    #[error("Invalid superblock: {0}")]
    InvalidSuperblock(String),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

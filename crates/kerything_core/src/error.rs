//! Core error types for Kerything.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed scanner payload or index data
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Record count or string pool size outside the acceptance window
    #[error("Resource limit: {0}")]
    ResourceLimit(String),

    /// Name slice points outside the string pool
    #[error("Corrupt record {index}: name range {offset}+{len} exceeds pool of {pool} bytes")]
    NameOutOfBounds {
        index: usize,
        offset: u32,
        len: u16,
        pool: u64,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

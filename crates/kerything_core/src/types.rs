//! Shared small types.

use std::fmt;
use std::str::FromStr;

/// Source filesystem of a device index. Determines which decoder produced
/// the records and how `modification_time` is interpreted (see
/// [`crate::time`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsType {
    Ntfs,
    #[default]
    Ext4,
}

impl FsType {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ntfs => "ntfs",
            Self::Ext4 => "ext4",
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for FsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ntfs" => Ok(Self::Ntfs),
            "ext4" => Ok(Self::Ext4),
            other => Err(format!("unsupported fsType '{other}'")),
        }
    }
}

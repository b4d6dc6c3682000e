//! Block-device byte access.
//!
//! Decoders read through the [`BlockSource`] trait so tests can substitute
//! an in-memory image for a real `/dev` node.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub trait BlockSource {
    /// Reads up to `buf.len()` bytes at `offset`, returning the count.
    fn read_chunk(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total size in bytes, when knowable (0 for unsized block devices).
    fn size(&self) -> u64;

    /// Fills `buf` exactly or fails with `UnexpectedEof`.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_chunk(offset + done as u64, &mut buf[done..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("short read at offset {}", offset + done as u64),
                )
                .into());
            }
            done += n;
        }
        Ok(())
    }
}

/// Positioned reads over an opened block device or image file.
pub struct DiskReader {
    file: File,
    size: u64,
}

impl DiskReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(false)
            .open(path.as_ref())?;

        #[cfg(target_os = "linux")]
        {
            use rustix::fs::{fadvise, Advice};
            let _ = fadvise(&file, 0, None, Advice::Sequential);
        }

        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        Ok(Self { file, size })
    }
}

impl BlockSource for DiskReader {
    fn read_chunk(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(self.file.read(buf)?)
    }

    #[inline]
    fn size(&self) -> u64 {
        self.size
    }
}

/// In-memory image, used by tests and the probe helpers.
impl<T: AsRef<[u8]>> BlockSource for std::io::Cursor<T> {
    fn read_chunk(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.get_ref().as_ref();
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(buf.len()).min(data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&data[start..end]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.get_ref().as_ref().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn disk_reader_positioned_reads() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();

        let mut reader = DiskReader::open(tmp.path()).unwrap();
        assert_eq!(reader.size(), 10);

        let mut buf = [0u8; 4];
        reader.read_exact_at(3, &mut buf).unwrap();
        assert_eq!(&buf, b"3456");
    }

    #[test]
    fn cursor_source_short_read_errors() {
        let mut src = std::io::Cursor::new(vec![1u8, 2, 3]);
        let mut buf = [0u8; 8];
        assert!(src.read_exact_at(0, &mut buf).is_err());
        let mut small = [0u8; 2];
        src.read_exact_at(1, &mut small).unwrap();
        assert_eq!(small, [2, 3]);
    }
}

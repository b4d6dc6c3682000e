//! The binary stream a scanner child writes on stdout.
//!
//! Layout (little-endian):
//!
//! ```text
//! u64 recordCount
//! [FileRecord × recordCount]   packed, no padding
//! u64 poolSize
//! [u8 × poolSize]              string pool
//! ```
//!
//! Parsing enforces the supervisor's acceptance window before any large
//! allocation: a hostile or corrupt child must not be able to make the
//! daemon balloon.

use crate::error::{CoreError, Result};
use crate::record::FileRecord;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Upper bound on records accepted from a single scan.
pub const MAX_RECORDS: u64 = 500_000_000;

/// Upper bound on the string pool accepted from a single scan (8 GiB).
pub const MAX_POOL_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// A decoded scan result: the raw inputs of a device index.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanPayload {
    pub records: Vec<FileRecord>,
    pub string_pool: Vec<u8>,
}

impl ScanPayload {
    /// Checks invariant I1 for every record.
    pub fn validate_name_ranges(&self) -> Result<()> {
        let pool = self.string_pool.len() as u64;
        for (i, r) in self.records.iter().enumerate() {
            let end = u64::from(r.name_offset) + u64::from(r.name_len);
            if end > pool {
                return Err(CoreError::NameOutOfBounds {
                    index: i,
                    offset: r.name_offset,
                    len: r.name_len,
                    pool,
                });
            }
        }
        Ok(())
    }
}

/// Serializes a payload in the scanner's stdout format.
pub fn write_payload<W: Write>(w: &mut W, payload: &ScanPayload) -> std::io::Result<()> {
    w.write_u64::<LittleEndian>(payload.records.len() as u64)?;
    for rec in &payload.records {
        rec.write_to(w)?;
    }
    w.write_u64::<LittleEndian>(payload.string_pool.len() as u64)?;
    w.write_all(&payload.string_pool)?;
    Ok(())
}

/// Parses and validates a scanner stdout stream.
///
/// Rejects empty or oversized record tables and pools, truncated streams,
/// and records whose name slice escapes the pool. Any error means the scan
/// is discarded; no index is installed from a partial parse.
pub fn parse_payload<R: Read>(r: &mut R) -> Result<ScanPayload> {
    let record_count = r
        .read_u64::<LittleEndian>()
        .map_err(|_| CoreError::InvalidFormat("failed to read recordCount".into()))?;

    if record_count == 0 || record_count > MAX_RECORDS {
        return Err(CoreError::ResourceLimit(format!(
            "invalid recordCount: {record_count}"
        )));
    }

    let mut records = Vec::with_capacity(record_count as usize);
    for i in 0..record_count {
        let rec = FileRecord::read_from(r).map_err(|_| {
            CoreError::InvalidFormat(format!("truncated stream while reading record {i}"))
        })?;
        records.push(rec);
    }

    let pool_size = r
        .read_u64::<LittleEndian>()
        .map_err(|_| CoreError::InvalidFormat("failed to read string pool size".into()))?;

    if pool_size == 0 || pool_size > MAX_POOL_BYTES {
        return Err(CoreError::ResourceLimit(format!(
            "invalid string pool size: {pool_size} bytes"
        )));
    }

    let mut string_pool = vec![0u8; pool_size as usize];
    r.read_exact(&mut string_pool)
        .map_err(|_| CoreError::InvalidFormat("truncated stream while reading string pool".into()))?;

    let payload = ScanPayload {
        records,
        string_pool,
    };
    payload.validate_name_ranges()?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ROOT_PARENT;

    fn sample_payload() -> ScanPayload {
        let mut pool = Vec::new();
        let mut records = Vec::new();

        let mut root = FileRecord::new(ROOT_PARENT, 0, 0);
        root.set_dir(true);
        records.push(root);

        let mut file = FileRecord::new(0, 128, 1_700_000_000);
        file.name_offset = pool.len() as u32;
        pool.extend_from_slice(b"Readme.txt");
        file.name_len = 10;
        records.push(file);

        ScanPayload {
            records,
            string_pool: pool,
        }
    }

    #[test]
    fn round_trip() {
        let payload = sample_payload();
        let mut buf = Vec::new();
        write_payload(&mut buf, &payload).unwrap();
        let back = parse_payload(&mut buf.as_slice()).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn rejects_zero_records() {
        let mut buf = Vec::new();
        write_payload(&mut buf, &ScanPayload::default()).unwrap();
        assert!(matches!(
            parse_payload(&mut buf.as_slice()),
            Err(CoreError::ResourceLimit(_))
        ));
    }

    #[test]
    fn rejects_truncated_records() {
        let payload = sample_payload();
        let mut buf = Vec::new();
        write_payload(&mut buf, &payload).unwrap();
        buf.truncate(8 + FileRecord::WIRE_SIZE + 5);
        assert!(matches!(
            parse_payload(&mut buf.as_slice()),
            Err(CoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_truncated_pool() {
        let payload = sample_payload();
        let mut buf = Vec::new();
        write_payload(&mut buf, &payload).unwrap();
        buf.pop();
        assert!(matches!(
            parse_payload(&mut buf.as_slice()),
            Err(CoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_name_range_out_of_bounds() {
        let mut payload = sample_payload();
        payload.records[1].name_len = 200;
        let mut buf = Vec::new();
        write_payload(&mut buf, &payload).unwrap();
        assert!(matches!(
            parse_payload(&mut buf.as_slice()),
            Err(CoreError::NameOutOfBounds { index: 1, .. })
        ));
    }

    #[test]
    fn rejects_absurd_record_count() {
        let mut buf = Vec::new();
        use byteorder::{LittleEndian, WriteBytesExt};
        buf.write_u64::<LittleEndian>(MAX_RECORDS + 1).unwrap();
        assert!(matches!(
            parse_payload(&mut buf.as_slice()),
            Err(CoreError::ResourceLimit(_))
        ));
    }
}

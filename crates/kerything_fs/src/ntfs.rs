//! NTFS MFT walker.
//!
//! Reads the boot sector to locate the Master File Table, decodes the
//! `$MFT` file's own data runs to handle MFT fragmentation, then walks
//! every in-use base record: applies sector fixups, collects resident
//! `$FILE_NAME` attributes (dropping DOS 8.3 shadows), takes the file size
//! from the unnamed `$DATA` attribute, and resolves parent MFT references
//! to dense record indices after the scan.

use crate::error::{DecodeError, Result};
use crate::io::BlockSource;
use crate::ProgressFn;
use byteorder::{ByteOrder, LittleEndian};
use kerything_core::payload::ScanPayload;
use kerything_core::record::{FileRecord, ROOT_PARENT};
use std::collections::HashMap;

const NTFS_OEM_ID: [u8; 8] = *b"NTFS    ";
const BOOT_SECTOR_SIZE: usize = 512;
const MFT_SIGNATURE: [u8; 4] = *b"FILE";

const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_END: u32 = 0xFFFF_FFFF;
const ATTR_HEADER_LEN: usize = 16;

const MFT_FLAG_IN_USE: u16 = 0x01;
const MFT_FLAG_DIRECTORY: u16 = 0x02;

/// $FILE_NAME namespaces: 0 = POSIX, 1 = Win32, 2 = DOS, 3 = Win32&DOS.
const NS_WIN32: u8 = 1;
const NS_DOS: u8 = 2;
const NS_WIN32_AND_DOS: u8 = 3;

const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x0000_0400;
const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;
const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// MFT references carry the record number in the low 48 bits; the top 16
/// are a sequence number.
const MFT_REF_INDEX_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Fixed part of `$FILE_NAME` before the UTF-16 name.
const FILE_NAME_FIXED_LEN: usize = 66;

/// `$`-prefixed names below this MFT index are NTFS system files.
const SYSTEM_FILE_CUTOFF: u64 = 16;

const BATCH_BYTES: usize = 4 * 1024 * 1024;

/// Parsed boot-sector geometry.
#[derive(Debug)]
struct BootSector {
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    mft_start_lcn: u64,
    clusters_per_file_record: i8,
}

impl BootSector {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(DecodeError::InvalidGeometry("boot sector too small".into()));
        }

        let mut oem = [0u8; 8];
        oem.copy_from_slice(&data[3..11]);
        if oem != NTFS_OEM_ID {
            return Err(DecodeError::BadOemId(oem));
        }

        Ok(Self {
            bytes_per_sector: LittleEndian::read_u16(&data[11..]),
            sectors_per_cluster: data[13],
            mft_start_lcn: LittleEndian::read_u64(&data[48..]),
            clusters_per_file_record: data[64] as i8,
        })
    }

    fn bytes_per_cluster(&self) -> u64 {
        u64::from(self.bytes_per_sector) * u64::from(self.sectors_per_cluster)
    }

    /// Record size is in clusters when positive, `2^-n` bytes when negative
    /// (typically -10, i.e. 1024).
    fn record_size(&self) -> u64 {
        let c = i64::from(self.clusters_per_file_record);
        if c > 0 {
            c as u64 * self.bytes_per_cluster()
        } else if c > -64 {
            1u64 << (-c)
        } else {
            0
        }
    }

    fn mft_offset(&self) -> u64 {
        self.mft_start_lcn * self.bytes_per_cluster()
    }
}

/// One fragment of the `$MFT` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MftRun {
    vcn: u64,
    lcn: u64,
    clusters: u64,
}

/// Decodes the mapping pairs of a non-resident attribute.
///
/// Each run is one header byte `(offSize << 4) | lenSize` followed by that
/// many little-endian length and (sign-extended) offset bytes; offsets are
/// cumulative deltas from the previous run's LCN.
fn parse_data_runs(attr: &[u8]) -> Vec<MftRun> {
    let mut runs = Vec::new();
    if attr.len() < 34 {
        return runs;
    }

    let mut pos = LittleEndian::read_u16(&attr[32..]) as usize;
    let mut vcn: u64 = 0;
    let mut lcn: i64 = 0;

    while pos < attr.len() {
        let header = attr[pos];
        pos += 1;
        if header == 0 {
            break;
        }

        let len_size = (header & 0x0F) as usize;
        let off_size = (header >> 4) as usize;
        if len_size == 0 || len_size > 8 || off_size > 8 || pos + len_size + off_size > attr.len() {
            break;
        }

        let mut clusters: u64 = 0;
        for i in 0..len_size {
            clusters |= u64::from(attr[pos + i]) << (8 * i);
        }
        pos += len_size;

        let mut delta: i64 = 0;
        for i in 0..off_size {
            delta |= i64::from(attr[pos + i]) << (8 * i);
        }
        pos += off_size;

        // Offsets are signed; sign-extend from the top bit of the encoding.
        if off_size > 0 && off_size < 8 && delta & (1i64 << (off_size * 8 - 1)) != 0 {
            delta |= !0i64 << (off_size * 8);
        }

        lcn += delta;
        runs.push(MftRun {
            vcn,
            lcn: lcn as u64,
            clusters,
        });
        vcn += clusters;
    }

    runs
}

/// Undoes the update-sequence-array protection of one MFT record.
///
/// The last two bytes of every sector must equal `USA[0]`; they are
/// replaced with the saved `USA[i + 1]` values. A mismatched sector is
/// left untouched (the record may be partially written).
fn apply_fixups(buf: &mut [u8]) {
    if buf.len() < 8 {
        return;
    }
    let usa_offset = LittleEndian::read_u16(&buf[4..]) as usize;
    let usa_size = LittleEndian::read_u16(&buf[6..]) as usize;
    if usa_size < 2 {
        return;
    }
    let sector_count = usa_size - 1;
    if usa_offset + 2 * usa_size > buf.len() {
        return;
    }

    let bytes_per_sector = buf.len() / sector_count;
    if bytes_per_sector < 2 {
        return;
    }

    let sequence = LittleEndian::read_u16(&buf[usa_offset..]);

    for i in 0..sector_count {
        let end = (i + 1) * bytes_per_sector - 2;
        if end + 2 > buf.len() {
            break;
        }
        if LittleEndian::read_u16(&buf[end..]) != sequence {
            continue;
        }
        let saved = LittleEndian::read_u16(&buf[usa_offset + 2 * (i + 1)..]);
        LittleEndian::write_u16(&mut buf[end..end + 2], saved);
    }
}

fn utf16le_to_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes.chunks_exact(2).map(LittleEndian::read_u16).collect();
    String::from_utf16(&units).unwrap_or_else(|_| "Invalid UTF-16 Data".to_string())
}

/// One retained name of a record ("hard link").
#[derive(Debug)]
struct FileLink {
    name: String,
    parent_mft: u64,
}

#[derive(Debug, Default)]
struct FileInfo {
    links: Vec<FileLink>,
    size: u64,
    modification_time: u64,
    is_dir: bool,
    is_symlink: bool,
}

/// Extracts names and metadata from one fixed-up MFT record.
fn decode_record(buf: &[u8]) -> FileInfo {
    struct TempLink {
        name: String,
        parent: u64,
        namespace: u8,
        mod_time: u64,
        data_size: u64,
    }

    let header_flags = LittleEndian::read_u16(&buf[22..]);
    let mut info = FileInfo {
        is_dir: header_flags & MFT_FLAG_DIRECTORY != 0,
        ..FileInfo::default()
    };

    let used = (LittleEndian::read_u32(&buf[24..]) as usize).min(buf.len());
    let mut attr_offset = LittleEndian::read_u16(&buf[20..]) as usize;

    let mut all_names: Vec<TempLink> = Vec::new();
    let mut size_from_data = 0u64;
    let mut data_attr_found = false;

    while attr_offset + ATTR_HEADER_LEN <= used {
        let attr_type = LittleEndian::read_u32(&buf[attr_offset..]);
        if attr_type == ATTR_END {
            break;
        }
        let length = LittleEndian::read_u32(&buf[attr_offset + 4..]) as usize;
        if length == 0 || attr_offset + length > used {
            break;
        }
        let non_resident = buf[attr_offset + 8];
        let attr_name_len = buf[attr_offset + 9];

        if attr_type == ATTR_FILE_NAME && non_resident == 0 {
            // Resident $FILE_NAME; non-resident names only occur via
            // extension records, which base-record scanning skips anyway.
            let data_offset = LittleEndian::read_u16(&buf[attr_offset + 20..]) as usize;
            let fn_start = attr_offset + data_offset;

            if fn_start + FILE_NAME_FIXED_LEN <= used {
                let name_chars = buf[fn_start + 64] as usize;
                let namespace = buf[fn_start + 65];
                let name_end = fn_start + FILE_NAME_FIXED_LEN + name_chars * 2;

                if name_end <= used {
                    let parent =
                        LittleEndian::read_u64(&buf[fn_start..]) & MFT_REF_INDEX_MASK;
                    let mod_time = LittleEndian::read_u64(&buf[fn_start + 16..]);
                    let data_size = LittleEndian::read_u64(&buf[fn_start + 48..]);
                    let fn_flags = LittleEndian::read_u32(&buf[fn_start + 56..]);
                    let reparse = LittleEndian::read_u32(&buf[fn_start + 60..]);

                    all_names.push(TempLink {
                        name: utf16le_to_string(
                            &buf[fn_start + FILE_NAME_FIXED_LEN..name_end],
                        ),
                        parent,
                        namespace,
                        mod_time,
                        data_size,
                    });

                    if fn_flags & FILE_ATTRIBUTE_REPARSE_POINT != 0
                        && (reparse == IO_REPARSE_TAG_SYMLINK
                            || reparse == IO_REPARSE_TAG_MOUNT_POINT)
                    {
                        info.is_symlink = true;
                    }
                }
            }
        } else if attr_type == ATTR_DATA && attr_name_len == 0 {
            data_attr_found = true;
            if non_resident == 0 {
                size_from_data = u64::from(LittleEndian::read_u32(&buf[attr_offset + 16..]));
            } else if attr_offset + 56 <= used {
                size_from_data = LittleEndian::read_u64(&buf[attr_offset + 48..]);
            }
        }

        attr_offset += length;
    }

    // A DOS 8.3 name is a shadow of a Win32 sibling with the same parent;
    // suppress it only when such a sibling exists. Every retained name
    // becomes an independent record.
    let mut size_from_file_name = 0u64;
    for entry in &all_names {
        let shadowed = entry.namespace == NS_DOS
            && all_names
                .iter()
                .any(|o| o.namespace != NS_DOS && o.parent == entry.parent);
        if shadowed {
            continue;
        }

        info.links.push(FileLink {
            name: entry.name.clone(),
            parent_mft: entry.parent,
        });

        if info.modification_time == 0
            || entry.namespace == NS_WIN32
            || entry.namespace == NS_WIN32_AND_DOS
        {
            info.modification_time = entry.mod_time;
            size_from_file_name = entry.data_size;
        }
    }

    // Some directories and system files have no unnamed $DATA; fall back
    // to the size cached in $FILE_NAME.
    info.size = if data_attr_found {
        size_from_data
    } else {
        size_from_file_name
    };

    info
}

#[derive(Default)]
struct NtfsDatabase {
    records: Vec<FileRecord>,
    string_pool: Vec<u8>,
    mft_to_record_idx: HashMap<u64, u32>,
    temp_parent_mfts: Vec<u64>,
}

impl NtfsDatabase {
    fn add(&mut self, name: &str, mft_index: u64, info: &FileInfo, parent_mft: u64) {
        let current_idx = self.records.len() as u32;

        let mut rec = FileRecord::new(0, info.size, info.modification_time);
        rec.name_offset = self.string_pool.len() as u32;
        rec.name_len = name.len().min(u16::MAX as usize) as u16;
        rec.set_dir(info.is_dir);
        rec.set_symlink(info.is_symlink);

        self.records.push(rec);
        self.temp_parent_mfts.push(parent_mft);
        self.string_pool
            .extend_from_slice(&name.as_bytes()[..rec.name_len as usize]);
        self.mft_to_record_idx.insert(mft_index, current_idx);
    }

    /// Rewrites parent MFT references to dense record indices; unknown
    /// parents become the root sentinel. Side tables are dropped here.
    fn resolve_parent_pointers(mut self) -> ScanPayload {
        for (i, rec) in self.records.iter_mut().enumerate() {
            let parent_mft = self.temp_parent_mfts[i];
            rec.parent_record_idx = self
                .mft_to_record_idx
                .get(&parent_mft)
                .copied()
                .unwrap_or(ROOT_PARENT);
        }

        ScanPayload {
            records: self.records,
            string_pool: self.string_pool,
        }
    }
}

/// Walks the MFT of an NTFS volume and produces the record table.
pub fn parse_mft<S: BlockSource>(source: &mut S, progress: ProgressFn<'_>) -> Result<ScanPayload> {
    let mut boot = [0u8; BOOT_SECTOR_SIZE];
    source.read_exact_at(0, &mut boot)?;
    let boot = BootSector::parse(&boot)?;

    let bytes_per_cluster = boot.bytes_per_cluster();
    let record_size = boot.record_size();
    let mft_offset = boot.mft_offset();

    if bytes_per_cluster == 0 || mft_offset == 0 || !(128..=16 * 1024 * 1024).contains(&record_size)
    {
        return Err(DecodeError::InvalidGeometry(format!(
            "bytesPerCluster={bytes_per_cluster} recordSize={record_size} mftOffset={mft_offset}"
        )));
    }

    tracing::debug!(
        bytes_per_sector = boot.bytes_per_sector,
        sectors_per_cluster = boot.sectors_per_cluster,
        mft_start_lcn = boot.mft_start_lcn,
        record_size,
        "NTFS volume geometry"
    );

    // Record 0 is the $MFT file itself; its unnamed $DATA attribute maps
    // every MFT fragment.
    let mut record0 = vec![0u8; record_size as usize];
    source.read_exact_at(mft_offset, &mut record0)?;
    apply_fixups(&mut record0);

    let used = (LittleEndian::read_u32(&record0[24..]) as usize).min(record0.len());
    let mut attr_offset = LittleEndian::read_u16(&record0[20..]) as usize;
    let mut mft_runs: Vec<MftRun> = Vec::new();
    let mut total_mft_size = 0u64;

    while attr_offset + ATTR_HEADER_LEN <= used {
        let attr_type = LittleEndian::read_u32(&record0[attr_offset..]);
        if attr_type == ATTR_END {
            break;
        }
        let length = LittleEndian::read_u32(&record0[attr_offset + 4..]) as usize;
        if length == 0 || attr_offset + length > used {
            break;
        }

        if attr_type == ATTR_DATA {
            mft_runs = parse_data_runs(&record0[attr_offset..attr_offset + length]);
            if record0[attr_offset + 8] != 0 && attr_offset + 56 <= used {
                total_mft_size = LittleEndian::read_u64(&record0[attr_offset + 48..]);
            }
            break;
        }

        attr_offset += length;
    }

    if mft_runs.is_empty() || total_mft_size == 0 {
        return Err(DecodeError::InvalidGeometry(
            "$MFT record carries no usable data runs".into(),
        ));
    }

    let total_records = total_mft_size / record_size;
    if total_records > kerything_core::payload::MAX_RECORDS {
        return Err(DecodeError::InvalidGeometry(format!(
            "implausible MFT record count {total_records}"
        )));
    }
    tracing::debug!(fragments = mft_runs.len(), total_records, "MFT mapped");
    progress(0, total_records);

    let batch_records = (BATCH_BYTES as u64 / record_size).max(1);
    let mut batch = vec![0u8; (batch_records * record_size) as usize];

    let mut db = NtfsDatabase::default();
    db.records.reserve(total_records as usize);
    db.temp_parent_mfts.reserve(total_records as usize);
    db.string_pool.reserve(total_records as usize * 20);

    let mut done = 0u64;

    for run in &mft_runs {
        let run_offset = run.lcn.saturating_mul(bytes_per_cluster);
        let records_in_run = run.clusters.saturating_mul(bytes_per_cluster) / record_size;
        let run_start_index = run.vcn.saturating_mul(bytes_per_cluster) / record_size;

        let mut r = 0u64;
        while r < records_in_run {
            let to_read = batch_records.min(records_in_run - r);
            let chunk = &mut batch[..(to_read * record_size) as usize];
            source.read_exact_at(run_offset + r * record_size, chunk)?;

            for i in 0..to_read {
                let rec_buf =
                    &mut chunk[(i * record_size) as usize..((i + 1) * record_size) as usize];
                done += 1;
                progress(done.min(total_records), total_records);

                if rec_buf[0..4] != MFT_SIGNATURE {
                    continue;
                }
                let flags = LittleEndian::read_u16(&rec_buf[22..]);
                let base_record = LittleEndian::read_u64(&rec_buf[32..]);
                if flags & MFT_FLAG_IN_USE == 0 || base_record != 0 {
                    continue;
                }

                apply_fixups(rec_buf);
                let record_index = run_start_index + r + i;
                let info = decode_record(rec_buf);

                for link in &info.links {
                    if link.name.starts_with('$') && record_index < SYSTEM_FILE_CUTOFF {
                        continue;
                    }
                    db.add(&link.name, record_index, &info, link.parent_mft);
                }
            }

            r += to_read;
        }
    }

    progress(total_records, total_records);
    tracing::debug!(entries = db.records.len(), "MFT scan complete");

    Ok(db.resolve_parent_pointers())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const RECORD_SIZE: usize = 1024;
    const USN: u16 = 0x1234;

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        LittleEndian::write_u16(&mut buf[off..off + 2], v);
    }
    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        LittleEndian::write_u32(&mut buf[off..off + 4], v);
    }
    fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        LittleEndian::write_u64(&mut buf[off..off + 8], v);
    }

    /// 512-byte boot sector: 512 b/sector, 1 sector/cluster, MFT at LCN 2,
    /// 1024-byte records.
    fn make_boot_sector() -> Vec<u8> {
        let mut b = vec![0u8; 512];
        b[3..11].copy_from_slice(b"NTFS    ");
        put_u16(&mut b, 11, 512);
        b[13] = 1;
        put_u64(&mut b, 48, 2);
        b[64] = (-10i8) as u8;
        b
    }

    fn file_name_attr(
        parent: u64,
        namespace: u8,
        mtime: u64,
        data_size: u64,
        fn_flags: u32,
        reparse: u32,
        name: &str,
    ) -> Vec<u8> {
        let utf16: Vec<u16> = name.encode_utf16().collect();
        let body_len = FILE_NAME_FIXED_LEN + utf16.len() * 2;
        let total = (ATTR_HEADER_LEN + 8 + body_len + 7) & !7;

        let mut a = vec![0u8; total];
        put_u32(&mut a, 0, ATTR_FILE_NAME);
        put_u32(&mut a, 4, total as u32);
        a[8] = 0; // resident
        put_u32(&mut a, 16, body_len as u32); // data length
        put_u16(&mut a, 20, (ATTR_HEADER_LEN + 8) as u16); // data offset

        let f = ATTR_HEADER_LEN + 8;
        put_u64(&mut a, f, parent);
        put_u64(&mut a, f + 16, mtime);
        put_u64(&mut a, f + 48, data_size);
        put_u32(&mut a, f + 56, fn_flags);
        put_u32(&mut a, f + 60, reparse);
        a[f + 64] = utf16.len() as u8;
        a[f + 65] = namespace;
        for (i, u) in utf16.iter().enumerate() {
            put_u16(&mut a, f + 66 + i * 2, *u);
        }
        a
    }

    fn resident_data_attr(data_len: u32) -> Vec<u8> {
        let mut a = vec![0u8; 24];
        put_u32(&mut a, 0, ATTR_DATA);
        put_u32(&mut a, 4, 24);
        a[8] = 0;
        put_u32(&mut a, 16, data_len);
        a
    }

    /// Non-resident unnamed $DATA with one run (lcn, clusters) and the
    /// given total data size.
    fn nonresident_data_attr(lcn: u8, clusters: u8, data_size: u64) -> Vec<u8> {
        let mut a = vec![0u8; 72];
        put_u32(&mut a, 0, ATTR_DATA);
        put_u32(&mut a, 4, 72);
        a[8] = 1; // non-resident
        put_u16(&mut a, 32, 64); // mapping pairs offset
        put_u64(&mut a, 48, data_size);
        a[64] = 0x11;
        a[65] = clusters;
        a[66] = lcn;
        a
    }

    fn assemble_record(flags: u16, attrs: &[Vec<u8>]) -> Vec<u8> {
        let mut rec = vec![0u8; RECORD_SIZE];
        rec[0..4].copy_from_slice(b"FILE");
        put_u16(&mut rec, 4, 48); // USA offset
        put_u16(&mut rec, 6, 3); // USA size (2 sectors + seq)
        put_u16(&mut rec, 20, 56); // first attribute
        put_u16(&mut rec, 22, flags);

        let mut off = 56;
        for attr in attrs {
            rec[off..off + attr.len()].copy_from_slice(attr);
            off += attr.len();
        }
        put_u32(&mut rec, off, ATTR_END);
        put_u32(&mut rec, 24, (off + 8) as u32); // used size

        // Encode fixups: save real sector tails into the USA, stamp USN.
        put_u16(&mut rec, 48, USN);
        for i in 0..2usize {
            let end = (i + 1) * 512 - 2;
            let saved = LittleEndian::read_u16(&rec[end..]);
            put_u16(&mut rec, 48 + 2 * (i + 1), saved);
            put_u16(&mut rec, end, USN);
        }
        rec
    }

    /// Image layout: boot sector, then a contiguous MFT at LCN 2 (offset
    /// 1024) covering `count` records.
    fn build_image(records: &[(u64, Vec<u8>)], count: u64) -> Vec<u8> {
        let mft_offset = 1024usize;
        let mut img = vec![0u8; mft_offset + count as usize * RECORD_SIZE];
        img[..512].copy_from_slice(&make_boot_sector());

        let clusters = (count as usize * RECORD_SIZE / 512) as u8;
        let mft_record = assemble_record(
            MFT_FLAG_IN_USE,
            &[nonresident_data_attr(2, clusters, count * RECORD_SIZE as u64)],
        );
        img[mft_offset..mft_offset + RECORD_SIZE].copy_from_slice(&mft_record);

        for (idx, rec) in records {
            let at = mft_offset + *idx as usize * RECORD_SIZE;
            img[at..at + RECORD_SIZE].copy_from_slice(rec);
        }
        img
    }

    fn scan(img: Vec<u8>) -> ScanPayload {
        let mut src = Cursor::new(img);
        let mut last = (0u64, 0u64);
        let payload = parse_mft(&mut src, &mut |d, t| last = (d, t)).unwrap();
        assert_eq!(last.0, last.1, "progress must reach completion");
        payload
    }

    fn names(payload: &ScanPayload) -> Vec<String> {
        payload
            .records
            .iter()
            .map(|r| String::from_utf8_lossy(r.name(&payload.string_pool)).into_owned())
            .collect()
    }

    #[test]
    fn rejects_bad_oem_id() {
        let mut img = vec![0u8; 2048];
        img[3..11].copy_from_slice(b"MSDOS5.0");
        let mut src = Cursor::new(img);
        assert!(matches!(
            parse_mft(&mut src, &mut |_, _| {}),
            Err(DecodeError::BadOemId(_))
        ));
    }

    #[test]
    fn rejects_zero_geometry() {
        let mut img = vec![0u8; 2048];
        img[3..11].copy_from_slice(b"NTFS    ");
        // bytes_per_sector etc. left zero
        let mut src = Cursor::new(img);
        assert!(matches!(
            parse_mft(&mut src, &mut |_, _| {}),
            Err(DecodeError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn data_runs_decode_with_sign_extension() {
        // Two runs: absolute LCN 3 for 4 clusters, then delta -2 for 1.
        let mut attr = vec![0u8; 40];
        put_u16(&mut attr, 32, 34);
        attr[34..40].copy_from_slice(&[0x11, 0x04, 0x03, 0x11, 0x01, 0xFE]);
        let runs = parse_data_runs(&attr);
        assert_eq!(
            runs,
            vec![
                MftRun {
                    vcn: 0,
                    lcn: 3,
                    clusters: 4
                },
                MftRun {
                    vcn: 4,
                    lcn: 1,
                    clusters: 1
                },
            ]
        );
    }

    #[test]
    fn fixups_restore_sector_tails_and_skip_mismatches() {
        let mut rec = vec![0u8; 1024];
        put_u16(&mut rec, 4, 48);
        put_u16(&mut rec, 6, 3);
        put_u16(&mut rec, 48, 0xBEEF); // sequence
        put_u16(&mut rec, 50, 0xAAAA); // saved tail, sector 0
        put_u16(&mut rec, 52, 0xBBBB); // saved tail, sector 1
        put_u16(&mut rec, 510, 0xBEEF); // matches
        put_u16(&mut rec, 1022, 0x0BAD); // torn sector

        apply_fixups(&mut rec);
        assert_eq!(LittleEndian::read_u16(&rec[510..]), 0xAAAA);
        assert_eq!(LittleEndian::read_u16(&rec[1022..]), 0x0BAD);
    }

    #[test]
    fn happy_path_suppresses_dos_shadow() {
        // Root dir at MFT 5; Readme.txt at MFT 42 carrying both a Win32
        // and a DOS name under the same parent. The DOS shadow is
        // suppressed; two records remain (root + file).
        let t1 = 0x01D9_0000_0000_0000u64;
        let root = assemble_record(
            MFT_FLAG_IN_USE | MFT_FLAG_DIRECTORY,
            &[file_name_attr(5, NS_WIN32, 0, 0, 0, 0, ".")],
        );
        let file = assemble_record(
            MFT_FLAG_IN_USE,
            &[
                file_name_attr(5, NS_WIN32, t1, 128, 0, 0, "Readme.txt"),
                file_name_attr(5, NS_DOS, t1, 128, 0, 0, "README~1.TXT"),
                resident_data_attr(128),
            ],
        );

        let payload = scan(build_image(&[(5, root), (42, file)], 43));
        assert_eq!(payload.records.len(), 2);
        assert_eq!(names(&payload), vec![".", "Readme.txt"]);

        let file_rec = &payload.records[1];
        assert_eq!(file_rec.size, 128);
        assert_eq!(file_rec.modification_time, t1);
        assert!(!file_rec.is_dir());
        assert_eq!(file_rec.parent_record_idx, 0); // root's record
    }

    #[test]
    fn dos_only_name_is_retained() {
        // With no Win32 sibling, the DOS link survives.
        let root = assemble_record(
            MFT_FLAG_IN_USE | MFT_FLAG_DIRECTORY,
            &[file_name_attr(5, NS_WIN32, 0, 0, 0, 0, ".")],
        );
        let dos_only = assemble_record(
            MFT_FLAG_IN_USE,
            &[
                file_name_attr(5, NS_DOS, 7, 10, 0, 0, "LEGACY~1.TXT"),
                resident_data_attr(10),
            ],
        );

        let payload = scan(build_image(&[(5, root), (40, dos_only)], 41));
        assert_eq!(names(&payload), vec![".", "LEGACY~1.TXT"]);
    }

    #[test]
    fn hard_links_become_distinct_records() {
        let root = assemble_record(
            MFT_FLAG_IN_USE | MFT_FLAG_DIRECTORY,
            &[file_name_attr(5, NS_WIN32, 0, 0, 0, 0, ".")],
        );
        let linked = assemble_record(
            MFT_FLAG_IN_USE,
            &[
                file_name_attr(5, NS_WIN32, 9, 64, 0, 0, "one.bin"),
                file_name_attr(5, NS_WIN32, 9, 64, 0, 0, "two.bin"),
                resident_data_attr(64),
            ],
        );

        let payload = scan(build_image(&[(5, root), (30, linked)], 31));
        assert_eq!(names(&payload), vec![".", "one.bin", "two.bin"]);
        assert_eq!(payload.records[1].size, 64);
        assert_eq!(payload.records[2].size, 64);
    }

    #[test]
    fn reparse_tag_marks_symlink() {
        let root = assemble_record(
            MFT_FLAG_IN_USE | MFT_FLAG_DIRECTORY,
            &[file_name_attr(5, NS_WIN32, 0, 0, 0, 0, ".")],
        );
        let link = assemble_record(
            MFT_FLAG_IN_USE,
            &[file_name_attr(
                5,
                NS_WIN32,
                1,
                0,
                FILE_ATTRIBUTE_REPARSE_POINT,
                IO_REPARSE_TAG_SYMLINK,
                "link",
            )],
        );

        let payload = scan(build_image(&[(5, root), (33, link)], 34));
        let rec = &payload.records[1];
        assert!(rec.is_symlink());
    }

    #[test]
    fn system_files_below_cutoff_are_dropped() {
        let root = assemble_record(
            MFT_FLAG_IN_USE | MFT_FLAG_DIRECTORY,
            &[file_name_attr(5, NS_WIN32, 0, 0, 0, 0, ".")],
        );
        let bitmap = assemble_record(
            MFT_FLAG_IN_USE,
            &[file_name_attr(5, NS_WIN32, 0, 0, 0, 0, "$Bitmap")],
        );
        let user_dollar = assemble_record(
            MFT_FLAG_IN_USE,
            &[file_name_attr(5, NS_WIN32, 0, 0, 0, 0, "$notes.txt")],
        );

        let payload = scan(build_image(
            &[(5, root), (6, bitmap), (20, user_dollar)],
            21,
        ));
        assert_eq!(names(&payload), vec![".", "$notes.txt"]);
    }

    #[test]
    fn unknown_parent_resolves_to_root_sentinel() {
        let orphan = assemble_record(
            MFT_FLAG_IN_USE,
            &[file_name_attr(999, NS_WIN32, 0, 0, 0, 0, "orphan.txt")],
        );
        let payload = scan(build_image(&[(20, orphan)], 21));
        assert_eq!(payload.records.len(), 1);
        assert_eq!(payload.records[0].parent_record_idx, ROOT_PARENT);
    }

    #[test]
    fn not_in_use_and_extension_records_are_skipped() {
        let root = assemble_record(
            MFT_FLAG_IN_USE | MFT_FLAG_DIRECTORY,
            &[file_name_attr(5, NS_WIN32, 0, 0, 0, 0, ".")],
        );
        let deleted = assemble_record(0, &[file_name_attr(5, NS_WIN32, 0, 0, 0, 0, "gone")]);
        let mut extension = assemble_record(
            MFT_FLAG_IN_USE,
            &[file_name_attr(5, NS_WIN32, 0, 0, 0, 0, "ext")],
        );
        // mark as extension of record 5 (post-fixup area is fine: offset 32
        // is inside sector 0, not a sector tail)
        put_u64(&mut extension, 32, 5);

        let payload = scan(build_image(&[(5, root), (21, deleted), (22, extension)], 23));
        assert_eq!(names(&payload), vec!["."]);
    }

    #[test]
    fn invalid_utf16_name_is_tolerated() {
        // Build a name with an unpaired surrogate.
        let mut attr = file_name_attr(5, NS_WIN32, 0, 0, 0, 0, "xx");
        let f = ATTR_HEADER_LEN + 8;
        put_u16(&mut attr, f + 66, 0xD800);

        let root = assemble_record(
            MFT_FLAG_IN_USE | MFT_FLAG_DIRECTORY,
            &[file_name_attr(5, NS_WIN32, 0, 0, 0, 0, ".")],
        );
        let bad = assemble_record(MFT_FLAG_IN_USE, &[attr]);

        let payload = scan(build_image(&[(5, root), (25, bad)], 26));
        assert_eq!(names(&payload), vec![".", "Invalid UTF-16 Data"]);
    }
}

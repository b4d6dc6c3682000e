//! ext4 inode-table walker.
//!
//! Walks every allocated inode (links count > 0) for size/mtime/mode, and
//! iterates directory inodes' entry blocks to discover names and tree
//! structure. Directory data is located through either the extent tree or
//! the classic direct/indirect block pointers. Parent inode references are
//! resolved to dense record indices after the scan, and a second pass
//! copies the captured inode stats into every record of that inode.
//!
//! Hard links: each surviving directory entry mints an independent record.
//! Directory inodes cannot be hard-linked, so the first record seen for an
//! inode is the unambiguous target for parent resolution.

use crate::error::{DecodeError, Result};
use crate::io::BlockSource;
use crate::ProgressFn;
use byteorder::{ByteOrder, LittleEndian};
use kerything_core::payload::ScanPayload;
use kerything_core::record::{FileRecord, ROOT_PARENT};
use std::collections::HashMap;

pub(crate) const SUPERBLOCK_OFFSET: u64 = 1024;
pub(crate) const SUPERBLOCK_SIZE: usize = 1024;
pub(crate) const EXT4_SUPER_MAGIC: u16 = 0xEF53;

const EXT4_ROOT_INO: u32 = 2;

const INCOMPAT_64BIT: u32 = 0x80;

const EXTENT_MAGIC: u16 = 0xF30A;
const EXT4_EXTENTS_FL: u32 = 0x8_0000;

const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;
const S_IFLNK: u16 = 0xA000;

const INODE_READ_CHUNK: usize = 4 * 1024 * 1024;

/// The superblock fields the walker needs (plus display metadata).
#[derive(Debug, Clone)]
pub(crate) struct Superblock {
    pub inodes_count: u32,
    pub first_data_block: u32,
    pub block_size: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub desc_size: u16,
    pub volume_name: [u8; 16],
    pub uuid: [u8; 16],
}

impl Superblock {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(DecodeError::InvalidSuperblock("superblock too small".into()));
        }

        let magic = LittleEndian::read_u16(&data[56..]);
        if magic != EXT4_SUPER_MAGIC {
            return Err(DecodeError::InvalidSuperblock(format!(
                "bad magic {magic:#06x}"
            )));
        }

        let log_block_size = LittleEndian::read_u32(&data[24..]);
        if log_block_size > 6 {
            return Err(DecodeError::InvalidSuperblock(format!(
                "implausible log block size {log_block_size}"
            )));
        }
        let block_size = 1024u32 << log_block_size;

        let feature_incompat = LittleEndian::read_u32(&data[96..]);
        let desc_size_raw = LittleEndian::read_u16(&data[254..]);
        let desc_size = if feature_incompat & INCOMPAT_64BIT != 0 && desc_size_raw >= 64 {
            desc_size_raw
        } else {
            32
        };

        let mut volume_name = [0u8; 16];
        volume_name.copy_from_slice(&data[120..136]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&data[104..120]);

        let sb = Self {
            inodes_count: LittleEndian::read_u32(&data[0..]),
            first_data_block: LittleEndian::read_u32(&data[20..]),
            block_size,
            inodes_per_group: LittleEndian::read_u32(&data[40..]),
            inode_size: LittleEndian::read_u16(&data[88..]),
            desc_size,
            volume_name,
            uuid,
        };

        if sb.inode_size < 128 || sb.inodes_per_group == 0 {
            return Err(DecodeError::InvalidSuperblock(format!(
                "inodeSize={} inodesPerGroup={}",
                sb.inode_size, sb.inodes_per_group
            )));
        }
        if u64::from(sb.inodes_count) > kerything_core::payload::MAX_RECORDS {
            return Err(DecodeError::InvalidSuperblock(format!(
                "implausible inode count {}",
                sb.inodes_count
            )));
        }

        Ok(sb)
    }

    pub(crate) fn read<S: BlockSource>(source: &mut S) -> Result<Self> {
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        source.read_exact_at(SUPERBLOCK_OFFSET, &mut buf)?;
        Self::parse(&buf)
    }
}

/// The on-disk inode fields the walker needs.
#[derive(Debug, Clone)]
struct Inode {
    mode: u16,
    links_count: u16,
    size: u64,
    mtime: u32,
    flags: u32,
    block: [u8; 60],
}

impl Inode {
    fn parse(data: &[u8]) -> Self {
        let mut block = [0u8; 60];
        block.copy_from_slice(&data[40..100]);

        let size_lo = u64::from(LittleEndian::read_u32(&data[4..]));
        let size_hi = if data.len() >= 112 {
            u64::from(LittleEndian::read_u32(&data[108..]))
        } else {
            0
        };

        Self {
            mode: LittleEndian::read_u16(&data[0..]),
            links_count: LittleEndian::read_u16(&data[26..]),
            size: size_lo | (size_hi << 32),
            mtime: LittleEndian::read_u32(&data[16..]),
            flags: LittleEndian::read_u32(&data[32..]),
            block,
        }
    }

    fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FileStats {
    size: u64,
    mtime: u32,
    is_dir: bool,
    is_symlink: bool,
}

/// Collects the physical data blocks of a directory inode, in logical
/// order. Holes (zero pointers) are skipped.
fn collect_dir_blocks<S: BlockSource>(
    source: &mut S,
    block_size: u32,
    inode: &Inode,
) -> Result<Vec<u64>> {
    if inode.flags & EXT4_EXTENTS_FL != 0 {
        let mut extents: Vec<(u32, u64, u16)> = Vec::new();
        walk_extent_node(source, block_size, &inode.block, 8, &mut extents)?;
        extents.sort_unstable_by_key(|e| e.0);

        let mut blocks = Vec::new();
        for (_, phys, len) in extents {
            for i in 0..u64::from(len) {
                if phys != 0 {
                    blocks.push(phys + i);
                }
            }
        }
        Ok(blocks)
    } else {
        let mut blocks = Vec::new();
        legacy_blocks(source, block_size, &inode.block, &mut blocks)?;
        Ok(blocks)
    }
}

/// Recursively walks one extent-tree node (the 60-byte `i_block` area or
/// an on-disk index block).
fn walk_extent_node<S: BlockSource>(
    source: &mut S,
    block_size: u32,
    node: &[u8],
    depth_budget: u8,
    out: &mut Vec<(u32, u64, u16)>,
) -> Result<()> {
    if depth_budget == 0 || node.len() < 12 {
        return Ok(());
    }
    if LittleEndian::read_u16(&node[0..]) != EXTENT_MAGIC {
        return Ok(());
    }

    let entries = LittleEndian::read_u16(&node[2..]) as usize;
    let depth = LittleEndian::read_u16(&node[6..]);
    let avail = (node.len() - 12) / 12;
    let entries = entries.min(avail);

    for i in 0..entries {
        let e = &node[12 + i * 12..12 + (i + 1) * 12];
        if depth == 0 {
            let logical = LittleEndian::read_u32(&e[0..]);
            // High bit of the length marks an uninitialized extent.
            let len = LittleEndian::read_u16(&e[4..]) & 0x7FFF;
            let phys =
                (u64::from(LittleEndian::read_u16(&e[6..])) << 32) | u64::from(LittleEndian::read_u32(&e[8..]));
            out.push((logical, phys, len));
        } else {
            let child =
                (u64::from(LittleEndian::read_u16(&e[8..])) << 32) | u64::from(LittleEndian::read_u32(&e[4..]));
            if child == 0 {
                continue;
            }
            let mut buf = vec![0u8; block_size as usize];
            source.read_exact_at(child * u64::from(block_size), &mut buf)?;
            walk_extent_node(source, block_size, &buf, depth_budget - 1, out)?;
        }
    }
    Ok(())
}

/// Classic ext2/3 block mapping: 12 direct pointers, then single, double
/// and triple indirection.
fn legacy_blocks<S: BlockSource>(
    source: &mut S,
    block_size: u32,
    i_block: &[u8; 60],
    out: &mut Vec<u64>,
) -> Result<()> {
    for i in 0..12 {
        let b = LittleEndian::read_u32(&i_block[i * 4..]);
        if b != 0 {
            out.push(u64::from(b));
        }
    }
    for (slot, level) in [(12usize, 1u8), (13, 2), (14, 3)] {
        let b = LittleEndian::read_u32(&i_block[slot * 4..]);
        if b != 0 {
            push_indirect(source, block_size, u64::from(b), level, out)?;
        }
    }
    Ok(())
}

fn push_indirect<S: BlockSource>(
    source: &mut S,
    block_size: u32,
    block: u64,
    level: u8,
    out: &mut Vec<u64>,
) -> Result<()> {
    let mut buf = vec![0u8; block_size as usize];
    source.read_exact_at(block * u64::from(block_size), &mut buf)?;

    for chunk in buf.chunks_exact(4) {
        let b = u64::from(LittleEndian::read_u32(chunk));
        if b == 0 {
            continue;
        }
        if level == 1 {
            out.push(b);
        } else {
            push_indirect(source, block_size, b, level - 1, out)?;
        }
    }
    Ok(())
}

#[derive(Default)]
struct Ext4Database {
    records: Vec<FileRecord>,
    string_pool: Vec<u8>,
    inode_to_record_idx: HashMap<u32, u32>,
    /// Parallel to `records`: the containing directory's inode.
    temp_parent_inodes: Vec<u32>,
    /// Parallel to `records`: the inode each record describes.
    record_inodes: Vec<u32>,
    inode_stats: HashMap<u32, FileStats>,
}

impl Ext4Database {
    fn seed_root(&mut self) {
        let root = FileRecord::new(ROOT_PARENT, 0, 0);
        self.records.push(root);
        self.temp_parent_inodes.push(0);
        self.record_inodes.push(EXT4_ROOT_INO);
        self.inode_to_record_idx.insert(EXT4_ROOT_INO, 0);
    }

    fn on_dir_entry(&mut self, dir_ino: u32, ino: u32, name: &[u8], max_inodes: u32) {
        if ino == 0 || ino > max_inodes {
            return;
        }

        let new_idx = self.records.len() as u32;
        let mut rec = FileRecord::new(ROOT_PARENT, 0, 0);
        rec.name_offset = self.string_pool.len() as u32;
        rec.name_len = name.len().min(u16::MAX as usize) as u16;

        self.records.push(rec);
        self.temp_parent_inodes.push(dir_ino);
        self.record_inodes.push(ino);
        self.string_pool
            .extend_from_slice(&name[..rec.name_len as usize]);

        // First record wins as the resolution target; a re-encounter is a
        // hard link and keeps its own record.
        self.inode_to_record_idx.entry(ino).or_insert(new_idx);
    }

    fn finish(mut self) -> ScanPayload {
        for (i, rec) in self.records.iter_mut().enumerate() {
            let parent_ino = self.temp_parent_inodes[i];
            rec.parent_record_idx = if parent_ino == EXT4_ROOT_INO {
                ROOT_PARENT
            } else {
                self.inode_to_record_idx
                    .get(&parent_ino)
                    .copied()
                    .unwrap_or(ROOT_PARENT)
            };
        }

        for (i, rec) in self.records.iter_mut().enumerate() {
            if let Some(st) = self.inode_stats.get(&self.record_inodes[i]) {
                rec.size = st.size;
                rec.modification_time = u64::from(st.mtime);
                rec.set_dir(st.is_dir);
                rec.set_symlink(st.is_symlink);
            }
        }

        ScanPayload {
            records: self.records,
            string_pool: self.string_pool,
        }
    }
}

/// Iterates one directory data block, invoking the database callback for
/// every surviving entry.
fn iterate_dir_block(db: &mut Ext4Database, dir_ino: u32, block: &[u8], max_inodes: u32) {
    let mut off = 0usize;
    while off + 8 <= block.len() {
        let ino = LittleEndian::read_u32(&block[off..]);
        let rec_len = LittleEndian::read_u16(&block[off + 4..]) as usize;
        // name_len may be co-packed with file-type bits; low 8 bits only.
        let name_len = (LittleEndian::read_u16(&block[off + 6..]) & 0xFF) as usize;

        if rec_len < 8 || off + rec_len > block.len() {
            break;
        }

        if ino != 0 && name_len > 0 && name_len <= rec_len - 8 {
            let name = &block[off + 8..off + 8 + name_len];
            if name != b"." && name != b".." {
                db.on_dir_entry(dir_ino, ino, name, max_inodes);
            }
        }

        off += rec_len;
    }
}

/// Walks the inode tables of an ext2/3/4 filesystem and produces the
/// record table.
pub fn parse_inodes<S: BlockSource>(
    source: &mut S,
    progress: ProgressFn<'_>,
) -> Result<ScanPayload> {
    let sb = Superblock::read(source)?;
    let block_size = sb.block_size;

    tracing::debug!(
        inodes = sb.inodes_count,
        block_size,
        inode_size = sb.inode_size,
        "ext4 volume geometry"
    );

    let group_count = sb.inodes_count.div_ceil(sb.inodes_per_group);

    // Group descriptor table sits in the block after the superblock.
    let gd_base = u64::from(sb.first_data_block + 1) * u64::from(block_size);
    let mut inode_tables: Vec<u64> = Vec::with_capacity(group_count as usize);
    let mut desc = vec![0u8; sb.desc_size as usize];
    for g in 0..group_count {
        source.read_exact_at(gd_base + u64::from(g) * u64::from(sb.desc_size), &mut desc)?;
        let lo = u64::from(LittleEndian::read_u32(&desc[8..]));
        let hi = if sb.desc_size >= 64 {
            u64::from(LittleEndian::read_u32(&desc[40..]))
        } else {
            0
        };
        inode_tables.push(lo | (hi << 32));
    }

    let mut db = Ext4Database::default();
    db.records.reserve(sb.inodes_count as usize);
    db.string_pool.reserve(sb.inodes_count as usize * 20);
    db.seed_root();

    let total = u64::from(sb.inodes_count);
    progress(0, total);

    let inode_size = usize::from(sb.inode_size);
    let chunk_inodes = (INODE_READ_CHUNK / inode_size).max(1);
    let mut done = 0u64;

    for g in 0..group_count {
        let table_offset = inode_tables[g as usize] * u64::from(block_size);
        let in_group =
            (sb.inodes_count - g * sb.inodes_per_group).min(sb.inodes_per_group) as usize;

        let mut idx = 0usize;
        while idx < in_group {
            let batch = chunk_inodes.min(in_group - idx);
            let mut buf = vec![0u8; batch * inode_size];
            source.read_exact_at(table_offset + (idx * inode_size) as u64, &mut buf)?;

            for i in 0..batch {
                let ino = g * sb.inodes_per_group + (idx + i) as u32 + 1;
                done += 1;
                progress(done.min(total), total);

                let raw = &buf[i * inode_size..(i + 1) * inode_size];
                let inode = Inode::parse(raw);
                if inode.links_count == 0 || inode.mode == 0 {
                    continue;
                }

                db.inode_stats.insert(
                    ino,
                    FileStats {
                        size: inode.size,
                        mtime: inode.mtime,
                        is_dir: inode.is_dir(),
                        is_symlink: inode.is_symlink(),
                    },
                );

                if inode.is_dir() {
                    let blocks = collect_dir_blocks(source, block_size, &inode)?;
                    let mut data = vec![0u8; block_size as usize];
                    for phys in blocks {
                        source.read_exact_at(phys * u64::from(block_size), &mut data)?;
                        iterate_dir_block(&mut db, ino, &data, sb.inodes_count);
                    }
                }
            }

            idx += batch;
        }
    }

    progress(total, total);
    tracing::debug!(entries = db.records.len(), "inode scan complete");

    Ok(db.finish())
}

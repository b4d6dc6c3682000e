//! On-disk index snapshots.
//!
//! A successful install is persisted so a daemon restart serves indexes
//! without re-scanning. The file carries a small header (filesystem type,
//! generation, timestamps, last-known display metadata) followed by the
//! same packed payload the scanner emits; acceleration structures are
//! rebuilt on load. Snapshots are best-effort: a corrupt or unreadable
//! file is skipped, never fatal.

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use kerything_core::index::DeviceIndex;
use kerything_core::payload::{parse_payload, write_payload, ScanPayload};
use kerything_core::types::FsType;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"KERYSNAP";
const VERSION: u32 = 1;

/// `<state_dir>/<uid>/<escaped-deviceId>.kidx`
pub fn snapshot_path(state_dir: &Path, uid: u32, device_id: &str) -> PathBuf {
    state_dir
        .join(uid.to_string())
        .join(format!("{}.kidx", escape_device_id(device_id)))
}

/// Device ids are `partuuid:<hex>`; anything outside a conservative
/// filename alphabet is mapped to `_`.
fn escape_device_id(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn save(path: &Path, device_id: &str, idx: &DeviceIndex) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    // Write to a sibling temp file and rename so readers never see a
    // half-written snapshot.
    let tmp = path.with_extension("kidx.tmp");
    {
        let file = std::fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        let mut w = BufWriter::with_capacity(1024 * 1024, file);

        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(VERSION)?;
        write_string(&mut w, device_id)?;
        w.write_u8(match idx.fs_type {
            FsType::Ntfs => 0,
            FsType::Ext4 => 1,
        })?;
        w.write_u64::<LittleEndian>(idx.generation)?;
        w.write_i64::<LittleEndian>(idx.last_indexed_time)?;
        write_string(&mut w, &idx.label_last_known)?;
        write_string(&mut w, &idx.uuid_last_known)?;

        let payload = ScanPayload {
            records: idx.records.clone(),
            string_pool: idx.string_pool.clone(),
        };
        write_payload(&mut w, &payload)?;
        w.flush()?;
    }
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Returns the owning device id alongside the rebuilt index.
pub fn load(path: &Path) -> Result<(String, DeviceIndex)> {
    let file =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut r = BufReader::with_capacity(1024 * 1024, file);

    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        bail!("not a kerything snapshot");
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != VERSION {
        bail!("unsupported snapshot version {version}");
    }

    let device_id = read_string(&mut r)?;
    let fs_type = match r.read_u8()? {
        0 => FsType::Ntfs,
        1 => FsType::Ext4,
        other => bail!("unknown fsType tag {other}"),
    };
    let generation = r.read_u64::<LittleEndian>()?;
    let last_indexed_time = r.read_i64::<LittleEndian>()?;
    let label = read_string(&mut r)?;
    let uuid = read_string(&mut r)?;

    let payload = parse_payload(&mut r).context("snapshot payload")?;

    let mut idx = DeviceIndex::build(fs_type, payload);
    idx.generation = generation;
    idx.last_indexed_time = last_indexed_time;
    idx.label_last_known = label;
    idx.uuid_last_known = uuid;
    Ok((device_id, idx))
}

/// Deletes the snapshot for a forgotten index; missing files are fine.
pub fn remove(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

/// All snapshot files under one uid's directory.
pub fn list_for_uid(state_dir: &Path, uid: u32) -> Vec<PathBuf> {
    let dir = state_dir.join(uid.to_string());
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "kidx"))
        .collect();
    out.sort();
    out
}

fn write_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    if len > 4096 {
        bail!("snapshot string field too long ({len})");
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

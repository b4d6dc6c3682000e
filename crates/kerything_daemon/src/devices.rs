//! Partition discovery and mount-point mapping.
//!
//! Device identity is the partition-table UUID: every entry of
//! `/dev/disk/by-partuuid` becomes a known device `partuuid:<uuid>`, its
//! symlink resolved to the canonical device node. Mount points come from
//! `/proc/self/mountinfo`, matching mount sources that resolve to the same
//! node. Filesystem type / label / UUID are probed from the superblocks we
//! already know how to read.

use kerything_core::types::FsType;
use kerything_fs::detect;
use kerything_fs::DiskReader;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct KnownDevice {
    pub device_id: String,
    pub dev_node: PathBuf,
    pub partuuid: String,
    pub fs_type: Option<FsType>,
    pub uuid: String,
    pub label: String,
    pub mount_points: Vec<String>,
    pub primary_mount_point: String,
}

impl KnownDevice {
    pub fn mounted(&self) -> bool {
        !self.mount_points.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "deviceId": self.device_id,
            "devNode": self.dev_node.to_string_lossy(),
            "fsType": self.fs_type.map(|t| t.name()).unwrap_or(""),
            "uuid": self.uuid,
            "label": self.label,
            "partuuid": self.partuuid,
            "mounted": self.mounted(),
            "mountPoints": self.mount_points,
            "primaryMountPoint": self.primary_mount_point,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfoEntry {
    pub mount_point: String,
    pub mount_source: String,
}

/// Parses `/proc/self/mountinfo` content.
///
/// Format per line: `id parent major:minor root mount_point opts ... -
/// fstype mount_source superopts`; only the mount point (field 5) and the
/// source after the separator matter here.
pub fn parse_mountinfo(content: &str) -> Vec<MountInfoEntry> {
    let mut out = Vec::new();

    for line in content.lines() {
        let Some(sep) = line.find(" - ") else {
            continue;
        };
        let (left, right) = (&line[..sep], &line[sep + 3..]);

        let mut left_fields = left.split_whitespace();
        let Some(mount_point) = left_fields.nth(4) else {
            continue;
        };

        let mut right_fields = right.split_whitespace();
        let (Some(_fstype), Some(mount_source)) = (right_fields.next(), right_fields.next())
        else {
            continue;
        };

        out.push(MountInfoEntry {
            mount_point: unescape_mount_path(mount_point),
            mount_source: mount_source.to_string(),
        });
    }

    out
}

/// mountinfo escapes space, tab, newline and backslash as octal.
fn unescape_mount_path(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let v = (octal[0] - b'0') * 64 + (octal[1] - b'0') * 8 + (octal[2] - b'0');
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Picks the mount point shown to users: prefer `/mnt`/`/media` (shortest
/// wins), otherwise the shortest path overall.
pub fn pick_primary_mount_point(mount_points: &[String]) -> String {
    let mut best: Option<&String> = None;
    for mp in mount_points {
        let preferred = mp == "/mnt"
            || mp == "/media"
            || mp.starts_with("/mnt/")
            || mp.starts_with("/media/");
        if preferred && best.is_none_or(|b| mp.len() < b.len()) {
            best = Some(mp);
        }
    }
    if best.is_none() {
        best = mount_points.iter().min_by_key(|mp| mp.len());
    }
    best.cloned().unwrap_or_default()
}

/// Enumerates partitions by partuuid, with mount state and probed
/// superblock metadata. Probe failures degrade to "unknown", never errors.
pub fn list_known_devices() -> Vec<KnownDevice> {
    let mountinfo = std::fs::read_to_string("/proc/self/mountinfo").unwrap_or_default();
    list_known_devices_in(Path::new("/dev/disk/by-partuuid"), &mountinfo)
}

fn list_known_devices_in(by_partuuid: &Path, mountinfo: &str) -> Vec<KnownDevice> {
    let mut devices = Vec::new();
    let Ok(entries) = std::fs::read_dir(by_partuuid) else {
        return devices;
    };
    let mounts = parse_mountinfo(mountinfo);

    for entry in entries.flatten() {
        let partuuid = entry.file_name().to_string_lossy().to_string();
        let Ok(dev_node) = std::fs::canonicalize(entry.path()) else {
            continue;
        };

        let mut dev = KnownDevice {
            device_id: format!("partuuid:{partuuid}"),
            partuuid,
            dev_node: dev_node.clone(),
            ..KnownDevice::default()
        };

        match DiskReader::open(&dev_node).and_then(|mut r| detect::probe(&mut r)) {
            Ok(info) => {
                dev.fs_type = info.fs_type;
                dev.label = info.label;
                dev.uuid = info.uuid;
            }
            Err(e) => {
                tracing::debug!("probe failed for {}: {e}", dev_node.display());
            }
        }

        let mut mount_points: Vec<String> = mounts
            .iter()
            .filter(|m| m.mount_source.starts_with("/dev/"))
            .filter(|m| {
                std::fs::canonicalize(&m.mount_source)
                    .map(|resolved| resolved == dev_node)
                    .unwrap_or(false)
            })
            .map(|m| m.mount_point.clone())
            .collect();
        mount_points.sort();
        mount_points.dedup();

        dev.primary_mount_point = pick_primary_mount_point(&mount_points);
        dev.mount_points = mount_points;
        devices.push(dev);
    }

    devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    devices
}

pub fn find_device(devices: &[KnownDevice], device_id: &str) -> Option<KnownDevice> {
    devices.iter().find(|d| d.device_id == device_id).cloned()
}

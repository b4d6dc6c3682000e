//! Live-watch supervision: fanotify subscriptions per watched device.
//!
//! Arming tries a filesystem-scope mark with directory-file-id + name
//! reporting first, then falls back to a mount-scope mark with a simpler
//! event set. Change events are coalesced per target into a pending map
//! keyed by `(fsid, fileHandle, name)`; a single-shot quiet timer
//! (re-armed on every new event) hands the batch to the service, which
//! re-scans the device. Arming failures back off exponentially; `EINVAL`
//! is treated as permanent for the current mount.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// Quiet interval before a coalesced batch is dispatched.
pub const QUIET_TIMER_MS: u64 = 2000;

const BACKOFF_BASE_MS: i64 = 30_000;
const BACKOFF_CAP_MS: i64 = 10 * 60_000;

const EVENT_METADATA_LEN: usize = 24;
const INFO_HEADER_LEN: usize = 4;

pub type WatchKey = (u32, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    FilesystemEvents,
    MountFallback,
}

impl WatchMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FilesystemEvents => "filesystemEvents",
            Self::MountFallback => "mountFallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WatchStatus {
    /// No refresh has established mount state yet.
    #[default]
    Pending,
    NotMounted,
    Watching,
    Error(String),
}

impl WatchStatus {
    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::NotMounted => "notMounted",
            Self::Watching => "watching",
            Self::Error(_) => "error",
        }
    }

    pub fn error_message(&self) -> &str {
        match self {
            Self::Error(msg) => msg,
            _ => "",
        }
    }
}

/// One coalesced change token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingTouched {
    pub fsid_hex: String,
    pub handle_hex: String,
    pub name: String,
    pub mask: u64,
}

impl PendingTouched {
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.fsid_hex, self.handle_hex, self.name)
    }
}

/// Per-`(uid, deviceId)` watch state.
#[derive(Default)]
pub struct Entry {
    pub mount_point: String,
    pub status: WatchStatus,
    pub mode: Option<WatchMode>,
    pub fail_count: u32,
    /// Epoch ms of the next timed retry; 0 = none scheduled.
    pub next_retry_at_ms: i64,
    pub retry_only_on_mount_change: bool,
    pub last_arm_error: String,

    pub pending: HashMap<String, PendingTouched>,
    pub overflow_seen: bool,

    /// Reader task owning the fanotify fd; aborted on teardown.
    pub task: Option<tokio::task::JoinHandle<()>>,
    /// Guards the entry against events from a superseded reader.
    pub epoch: u64,
}

impl Entry {
    /// Drops the subscription and any half-accumulated batch.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.pending.clear();
        self.overflow_seen = false;
        self.mode = None;
    }

    pub fn armed(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn reset_backoff(&mut self) {
        self.fail_count = 0;
        self.next_retry_at_ms = 0;
        self.last_arm_error.clear();
        self.retry_only_on_mount_change = false;
    }

    /// Records an arming failure: EINVAL is permanent for this mount,
    /// everything else schedules a timed retry.
    pub fn record_arm_failure(&mut self, errno: i32, message: String, now_ms: i64) {
        self.status = WatchStatus::Error(message.clone());
        self.last_arm_error = message;
        if errno == libc::EINVAL {
            self.retry_only_on_mount_change = true;
            self.next_retry_at_ms = 0;
        } else {
            self.retry_only_on_mount_change = false;
            self.fail_count = (self.fail_count + 1).min(30);
            self.next_retry_at_ms = now_ms + backoff_ms(self.fail_count);
        }
    }
}

#[derive(Default)]
pub struct WatchState {
    pub entries: HashMap<WatchKey, Entry>,
    next_epoch: u64,
}

impl WatchState {
    pub fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

/// Exponential arming backoff: 30s doubling per failure, capped at 10 min.
pub fn backoff_ms(fail_count: u32) -> i64 {
    if fail_count == 0 {
        return 0;
    }
    let shift = (fail_count - 1).min(16);
    (BACKOFF_BASE_MS << shift).min(BACKOFF_CAP_MS)
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct ArmError {
    pub errno: i32,
    pub message: String,
}

/// Arms a fanotify subscription on a mount point.
///
/// Attempt 1: filesystem-scope mark with FID + directory-name reporting.
/// Attempt 2: mount-scope mark with the simpler event set.
pub fn try_arm(mount_point: &str) -> Result<(OwnedFd, WatchMode), ArmError> {
    let c_path = CString::new(mount_point).map_err(|_| ArmError {
        errno: libc::EINVAL,
        message: format!("mount point contains NUL: {mount_point:?}"),
    })?;

    let mp_fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC | libc::O_DIRECTORY,
        )
    };
    if mp_fd < 0 {
        let e = std::io::Error::last_os_error();
        return Err(ArmError {
            errno: e.raw_os_error().unwrap_or(0),
            message: format!("open({mount_point}) failed: {e}"),
        });
    }

    let fs_mask: u64 = libc::FAN_CREATE
        | libc::FAN_DELETE
        | libc::FAN_MOVED_FROM
        | libc::FAN_MOVED_TO
        | libc::FAN_ATTRIB
        | libc::FAN_MODIFY
        | libc::FAN_CLOSE_WRITE
        | libc::FAN_DELETE_SELF
        | libc::FAN_MOVE_SELF
        | libc::FAN_ONDIR;

    unsafe {
        let fd = libc::fanotify_init(
            libc::FAN_CLOEXEC
                | libc::FAN_CLASS_NOTIF
                | libc::FAN_NONBLOCK
                | libc::FAN_REPORT_FID
                | libc::FAN_REPORT_DIR_FID
                | libc::FAN_REPORT_NAME,
            (libc::O_RDONLY | libc::O_LARGEFILE) as u32,
        );
        if fd >= 0 {
            if libc::fanotify_mark(
                fd,
                libc::FAN_MARK_ADD | libc::FAN_MARK_FILESYSTEM,
                fs_mask,
                mp_fd,
                std::ptr::null(),
            ) == 0
            {
                libc::close(mp_fd);
                return Ok((OwnedFd::from_raw_fd(fd), WatchMode::FilesystemEvents));
            }
            libc::close(fd);
            // fall through to the mount-scope attempt
        }

        let mount_mask: u64 = libc::FAN_CREATE
            | libc::FAN_DELETE
            | libc::FAN_MOVED_FROM
            | libc::FAN_MOVED_TO
            | libc::FAN_CLOSE_WRITE
            | libc::FAN_MODIFY
            | libc::FAN_ATTRIB
            | libc::FAN_ONDIR;

        let fd = libc::fanotify_init(
            libc::FAN_CLOEXEC | libc::FAN_CLASS_NOTIF | libc::FAN_NONBLOCK,
            (libc::O_RDONLY | libc::O_LARGEFILE) as u32,
        );
        if fd < 0 {
            let e = std::io::Error::last_os_error();
            libc::close(mp_fd);
            return Err(ArmError {
                errno: e.raw_os_error().unwrap_or(0),
                message: format!("fanotify_init failed: {e}"),
            });
        }

        if libc::fanotify_mark(
            fd,
            libc::FAN_MARK_ADD | libc::FAN_MARK_MOUNT,
            mount_mask,
            mp_fd,
            std::ptr::null(),
        ) != 0
        {
            let e = std::io::Error::last_os_error();
            libc::close(fd);
            libc::close(mp_fd);
            return Err(ArmError {
                errno: e.raw_os_error().unwrap_or(0),
                message: format!("fanotify_mark failed: {e}"),
            });
        }

        libc::close(mp_fd);
        Ok((OwnedFd::from_raw_fd(fd), WatchMode::MountFallback))
    }
}

#[derive(Debug, Default)]
pub struct ParsedEvents {
    pub touched: Vec<PendingTouched>,
    pub overflow: bool,
    pub saw_non_overflow: bool,
}

/// Decodes one `read()`'s worth of fanotify events.
///
/// Returns the parsed tokens plus any event fds the kernel handed over
/// (the caller must close them). Parsing is defensive throughout: a
/// malformed record ends its event, never the whole buffer.
pub fn parse_event_buffer(buf: &[u8]) -> (ParsedEvents, Vec<i32>) {
    let mut out = ParsedEvents::default();
    let mut fds = Vec::new();

    let mut off = 0usize;
    while off + EVENT_METADATA_LEN <= buf.len() {
        let event_len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        if event_len < EVENT_METADATA_LEN || off + event_len > buf.len() {
            break;
        }
        let mask = u64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap());
        let fd = i32::from_le_bytes(buf[off + 16..off + 20].try_into().unwrap());
        if fd >= 0 {
            fds.push(fd);
        }

        if mask & libc::FAN_Q_OVERFLOW != 0 {
            out.overflow = true;
        } else {
            out.saw_non_overflow = true;
            parse_info_records(&buf[off + EVENT_METADATA_LEN..off + event_len], mask, &mut out);
        }

        off += event_len;
    }

    (out, fds)
}

fn parse_info_records(mut info: &[u8], event_mask: u64, out: &mut ParsedEvents) {
    while info.len() >= INFO_HEADER_LEN {
        let info_type = info[0];
        let len = u16::from_le_bytes(info[2..4].try_into().unwrap()) as usize;
        if len < INFO_HEADER_LEN || len > info.len() {
            break;
        }

        if u32::from(info_type) == libc::FAN_EVENT_INFO_TYPE_DFID_NAME as u32 && len >= 20 {
            // Layout: header(4) fsid(8) handle_bytes(4) handle_type(4)
            // f_handle(handle_bytes) name(NUL-terminated)
            let fsid = &info[4..12];
            let handle_bytes =
                u32::from_le_bytes(info[12..16].try_into().unwrap()) as usize;
            let blob_end = 20usize.saturating_add(handle_bytes);

            if blob_end <= len {
                let handle_blob = &info[12..blob_end];
                let name_area = &info[blob_end..len];
                let name_len = name_area
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(name_area.len());
                let name = String::from_utf8_lossy(&name_area[..name_len]).into_owned();

                if !name.is_empty() {
                    out.touched.push(PendingTouched {
                        fsid_hex: hex(fsid),
                        handle_hex: hex(handle_blob),
                        name,
                        mask: event_mask,
                    });
                }
            }
        }

        info = &info[len..];
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Reader task: owns the fanotify fd, drains events on readiness, and
/// fires the quiet timer once activity pauses.
pub(crate) async fn run_watch_reader(
    daemon: crate::service::Daemon,
    key: WatchKey,
    fd: OwnedFd,
    epoch: u64,
) {
    let afd = match AsyncFd::with_interest(fd, Interest::READABLE) {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!("fanotify fd registration failed: {e}");
            return;
        }
    };

    let mut deadline: Option<tokio::time::Instant> = None;
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            readable = afd.readable() => {
                let mut guard = match readable {
                    Ok(g) => g,
                    Err(_) => return,
                };

                loop {
                    let n = unsafe {
                        libc::read(
                            afd.get_ref().as_raw_fd(),
                            buf.as_mut_ptr().cast(),
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        let err = std::io::Error::last_os_error();
                        if err.kind() == std::io::ErrorKind::WouldBlock {
                            guard.clear_ready();
                            break;
                        }
                        daemon.watch_read_error(&key, epoch, &err.to_string());
                        return;
                    }
                    if n == 0 {
                        guard.clear_ready();
                        break;
                    }

                    let (events, event_fds) = parse_event_buffer(&buf[..n as usize]);
                    for f in event_fds {
                        unsafe { libc::close(f) };
                    }

                    if daemon.watch_merge_events(&key, epoch, events) {
                        deadline = Some(
                            tokio::time::Instant::now()
                                + std::time::Duration::from_millis(QUIET_TIMER_MS),
                        );
                    }
                }
            }
            () = async move {
                // guarded by the `if`; unwrap is fine
                tokio::time::sleep_until(deadline.unwrap()).await;
            }, if deadline.is_some() => {
                deadline = None;
                daemon.watch_dispatch(&key, epoch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_ms(0), 0);
        assert_eq!(backoff_ms(1), 30_000);
        assert_eq!(backoff_ms(2), 60_000);
        assert_eq!(backoff_ms(3), 120_000);
        assert_eq!(backoff_ms(6), 600_000); // 30s * 32 = 960s, capped
        assert_eq!(backoff_ms(30), 600_000);
    }

    #[test]
    fn einval_is_permanent_for_mount() {
        let mut e = Entry::default();
        e.record_arm_failure(libc::EINVAL, "unsupported".into(), 1_000);
        assert!(e.retry_only_on_mount_change);
        assert_eq!(e.next_retry_at_ms, 0);
        assert_eq!(e.fail_count, 0);

        let mut e2 = Entry::default();
        e2.record_arm_failure(libc::EACCES, "denied".into(), 1_000);
        assert!(!e2.retry_only_on_mount_change);
        assert_eq!(e2.fail_count, 1);
        assert_eq!(e2.next_retry_at_ms, 1_000 + 30_000);
    }

    #[test]
    fn reset_backoff_clears_error_state() {
        let mut e = Entry::default();
        e.record_arm_failure(libc::EACCES, "denied".into(), 0);
        e.reset_backoff();
        assert_eq!(e.fail_count, 0);
        assert_eq!(e.next_retry_at_ms, 0);
        assert!(e.last_arm_error.is_empty());
    }

    fn fake_event(mask: u64, infos: &[Vec<u8>]) -> Vec<u8> {
        let info_len: usize = infos.iter().map(Vec::len).sum();
        let mut buf = vec![0u8; EVENT_METADATA_LEN];
        buf[0..4].copy_from_slice(&((EVENT_METADATA_LEN + info_len) as u32).to_le_bytes());
        buf[8..16].copy_from_slice(&mask.to_le_bytes());
        buf[16..20].copy_from_slice(&(-1i32).to_le_bytes());
        for info in infos {
            buf.extend_from_slice(info);
        }
        buf
    }

    fn dfid_name_info(fsid: [u8; 8], handle: &[u8], name: &str) -> Vec<u8> {
        let len = INFO_HEADER_LEN + 8 + 8 + handle.len() + name.len() + 1;
        let mut info = Vec::with_capacity(len);
        info.push(libc::FAN_EVENT_INFO_TYPE_DFID_NAME as u8);
        info.push(0);
        info.extend_from_slice(&(len as u16).to_le_bytes());
        info.extend_from_slice(&fsid);
        info.extend_from_slice(&(handle.len() as u32).to_le_bytes()); // handle_bytes
        info.extend_from_slice(&1i32.to_le_bytes()); // handle_type
        info.extend_from_slice(handle);
        info.extend_from_slice(name.as_bytes());
        info.push(0);
        info
    }

    #[test]
    fn parses_dfid_name_tokens() {
        let event = fake_event(
            libc::FAN_CREATE,
            &[dfid_name_info([1, 2, 3, 4, 5, 6, 7, 8], &[0xAA, 0xBB], "newfile.txt")],
        );
        let (parsed, fds) = parse_event_buffer(&event);
        assert!(fds.is_empty());
        assert!(parsed.saw_non_overflow);
        assert!(!parsed.overflow);
        assert_eq!(parsed.touched.len(), 1);

        let t = &parsed.touched[0];
        assert_eq!(t.name, "newfile.txt");
        assert_eq!(t.fsid_hex, "0102030405060708");
        assert!(t.handle_hex.ends_with("aabb"));
        assert_eq!(t.mask, libc::FAN_CREATE);
    }

    #[test]
    fn overflow_event_sets_flag_only() {
        let event = fake_event(libc::FAN_Q_OVERFLOW, &[]);
        let (parsed, _) = parse_event_buffer(&event);
        assert!(parsed.overflow);
        assert!(!parsed.saw_non_overflow);
        assert!(parsed.touched.is_empty());
    }

    #[test]
    fn concatenated_events_all_parse() {
        let mut buf = fake_event(libc::FAN_Q_OVERFLOW, &[]);
        buf.extend(fake_event(
            libc::FAN_MODIFY,
            &[dfid_name_info([0; 8], &[1], "a")],
        ));
        let (parsed, _) = parse_event_buffer(&buf);
        assert!(parsed.overflow);
        assert!(parsed.saw_non_overflow);
        assert_eq!(parsed.touched.len(), 1);
    }

    #[test]
    fn truncated_event_is_ignored() {
        let mut buf = fake_event(libc::FAN_MODIFY, &[]);
        buf[0..4].copy_from_slice(&9999u32.to_le_bytes());
        let (parsed, _) = parse_event_buffer(&buf);
        assert!(!parsed.saw_non_overflow);
        assert!(parsed.touched.is_empty());
    }

    #[test]
    fn touched_key_merges_identical_paths() {
        let a = PendingTouched {
            fsid_hex: "aa".into(),
            handle_hex: "bb".into(),
            name: "f".into(),
            mask: 1,
        };
        let b = PendingTouched {
            fsid_hex: "aa".into(),
            handle_hex: "bb".into(),
            name: "f".into(),
            mask: 2,
        };
        assert_eq!(a.key(), b.key());
    }
}

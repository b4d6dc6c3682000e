//! The daemon facade: owns all mutable state and implements the service
//! operations, translating between wire types and core types.
//!
//! All state lives behind one mutex and every mutation is a single locked
//! step, so searches observe a device index either entirely before or
//! entirely after an install. Terminal job classification happens in
//! exactly one place (`finish_job`); cancellation only transitions state.

use crate::devices::{self, KnownDevice};
use crate::jobs::{self, classify_outcome, ExitInfo, Job, JobState, Outcome};
use crate::protocol::{ErrorKind, JobStatus, Signal};
use crate::snapshot;
use crate::watch::{self, WatchKey, WatchState, WatchStatus};
use kerything_core::index::{DeviceIndex, SortDir, SortKey};
use kerything_core::query::{self, Page};
use kerything_core::store::IndexStore;
use kerything_core::types::FsType;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::broadcast;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Usage(_) => ErrorKind::Usage,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Clone)]
pub struct Config {
    pub scanner_path: PathBuf,
    pub state_dir: PathBuf,
}

#[derive(Default)]
struct State {
    store: IndexStore,
    jobs: HashMap<u64, Job>,
    next_job_id: u64,
    loaded_uids: HashSet<u32>,
    watch: WatchState,
    watch_enabled: HashSet<(u32, String)>,
}

struct Inner {
    state: Mutex<State>,
    signals: broadcast::Sender<Signal>,
    config: Config,
}

#[derive(Clone)]
pub struct Daemon {
    inner: Arc<Inner>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn join_internal_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let (signals, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_job_id: 1,
                    ..State::default()
                }),
                signals,
                config,
            }),
        }
    }

    pub fn scanner_path(&self) -> &Path {
        &self.inner.config.scanner_path
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.inner.signals.subscribe()
    }

    fn emit(&self, signal: Signal) {
        // send() only fails with zero subscribers, which is fine.
        let _ = self.inner.signals.send(signal);
    }

    /// Loads persisted snapshots for a uid the first time its indexes are
    /// touched. Corrupt snapshots are skipped with a warning.
    fn ensure_loaded(&self, state: &mut State, uid: u32) {
        if !state.loaded_uids.insert(uid) {
            return;
        }
        for path in snapshot::list_for_uid(&self.inner.config.state_dir, uid) {
            match snapshot::load(&path) {
                Ok((device_id, idx)) => {
                    let generation = idx.generation;
                    if state.store.adopt(uid, &device_id, idx) {
                        tracing::info!(uid, device_id = %device_id, generation, "loaded snapshot");
                    }
                }
                Err(e) => {
                    tracing::warn!("skipping snapshot {}: {e:#}", path.display());
                }
            }
        }
    }

    // ---- service operations -------------------------------------------

    pub fn ping(&self) -> Value {
        json!({
            "version": format!("kerythingd {VERSION}"),
            "apiVersion": crate::protocol::API_VERSION,
        })
    }

    pub fn list_known_devices(&self) -> Value {
        let devices = devices::list_known_devices();
        Value::Array(devices.iter().map(KnownDevice::to_json).collect())
    }

    pub fn list_indexed_devices(&self, uid: u32) -> Value {
        let mut state = self.inner.state.lock();
        self.ensure_loaded(&mut state, uid);

        let now = watch::now_ms();
        let mut out = Vec::new();

        let Some(devices) = state.store.devices_for(uid) else {
            return Value::Array(out);
        };

        for (device_id, idx) in devices {
            let key = (uid, device_id.clone());
            let enabled = state.watch_enabled.contains(&key);
            let entry = state.watch.entries.get(&key);

            let (watch_state, watch_error, fail_count, retry_at, retry_only_on_mount) = entry
                .map(|e| {
                    (
                        e.status.state_name(),
                        e.status.error_message().to_string(),
                        e.fail_count,
                        e.next_retry_at_ms,
                        e.retry_only_on_mount_change,
                    )
                })
                .unwrap_or(("pending", String::new(), 0, 0, false));

            let retry_in_sec = if retry_at > now {
                ((retry_at - now + 999) / 1000) as u64
            } else {
                0
            };
            let retry_mode = if retry_only_on_mount {
                "onMountChange"
            } else if retry_at > 0 {
                "timed"
            } else {
                ""
            };

            out.push(json!({
                "deviceId": device_id,
                "fsType": idx.fs_type.name(),
                "generation": idx.generation,
                "entryCount": idx.len() as u64,
                "lastIndexedTime": idx.last_indexed_time,
                "label": idx.label_last_known,
                "uuid": idx.uuid_last_known,
                "watchEnabled": enabled,
                "watchState": watch_state,
                "watchError": watch_error,
                "watchFailCount": fail_count,
                "watchRetryInSec": retry_in_sec,
                "watchRetryAtMs": retry_at,
                "watchRetryMode": retry_mode,
                "watchMode": entry.and_then(|e| e.mode).map(|m| m.name()).unwrap_or(""),
            }));
        }

        Value::Array(out)
    }

    pub fn start_index(&self, uid: u32, device_id: &str) -> ServiceResult<u64> {
        let known = devices::list_known_devices();
        let dev = devices::find_device(&known, device_id)
            .ok_or_else(|| ServiceError::Usage(format!("unknown deviceId '{device_id}'")))?;
        let fs_type: FsType = dev.fs_type.ok_or_else(|| {
            ServiceError::Usage(format!("device '{device_id}' has no supported filesystem"))
        })?;

        let mut state = self.inner.state.lock();
        self.ensure_loaded(&mut state, uid);

        // One scan per device in flight; a second request joins it.
        if let Some(job) = state
            .jobs
            .values()
            .find(|j| j.owner_uid == uid && j.device_id == device_id)
        {
            return Ok(job.job_id);
        }

        let job_id = state.next_job_id;
        state.next_job_id += 1;

        let props = json!({
            "deviceId": device_id,
            "devNode": dev.dev_node.to_string_lossy(),
            "fsType": fs_type.name(),
        });

        state.jobs.insert(
            job_id,
            Job {
                job_id,
                owner_uid: uid,
                device_id: device_id.to_string(),
                dev_node: dev.dev_node.clone(),
                fs_type,
                state: JobState::Running,
                pid: None,
                last_pct: 0,
            },
        );
        drop(state);

        self.emit(Signal::JobAdded {
            job_id,
            props: props.clone(),
        });
        self.emit(Signal::JobProgress {
            job_id,
            percent: 0,
            props,
        });

        tokio::spawn(jobs::run_job(
            self.clone(),
            job_id,
            dev.dev_node,
            fs_type,
        ));

        tracing::info!(job_id, device_id = %device_id, uid, "index job started");
        Ok(job_id)
    }

    /// Idempotent; a no-op for unknown (possibly already finished) jobs
    /// and for jobs already cancelling. Never emits the terminal signal.
    pub fn cancel_job(&self, job_id: u64) {
        let pid = {
            let mut state = self.inner.state.lock();
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return;
            };
            if job.state == JobState::Cancelling {
                return;
            }
            job.state = JobState::Cancelling;
            job.pid
        };

        tracing::info!(job_id, "cancelling job");
        if let Some(pid) = pid {
            jobs::signal_pid(pid, libc::SIGTERM);
        }

        let daemon = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(jobs::CANCEL_KILL_GRACE_MS))
                .await;
            let pid = {
                let state = daemon.inner.state.lock();
                state
                    .jobs
                    .get(&job_id)
                    .filter(|j| j.state == JobState::Cancelling)
                    .and_then(|j| j.pid)
            };
            if let Some(pid) = pid {
                tracing::info!(job_id, "grace expired, killing scanner");
                jobs::signal_pid(pid, libc::SIGKILL);
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn search(
        &self,
        uid: u32,
        query_text: &str,
        device_ids: &[String],
        sort_key: &str,
        sort_dir: &str,
        offset: u32,
        limit: u32,
    ) -> Value {
        let mut state = self.inner.state.lock();
        self.ensure_loaded(&mut state, uid);

        let page = Page {
            sort_key: SortKey::parse(sort_key),
            sort_dir: SortDir::parse(sort_dir),
            offset,
            limit,
        };

        let empty = Default::default();
        let devices = state.store.devices_for(uid).unwrap_or(&empty);
        let result = query::search(devices, query_text, device_ids, page);

        let rows: Vec<Value> = result
            .rows
            .iter()
            .map(|r| {
                json!([
                    r.entry_id,
                    r.device_id,
                    r.name,
                    r.dir_id,
                    r.size,
                    r.mtime,
                    r.flags
                ])
            })
            .collect();

        json!({ "totalHits": result.total_hits, "rows": rows })
    }

    pub fn resolve_directories(
        &self,
        uid: u32,
        device_id: &str,
        dir_ids: &[u32],
    ) -> ServiceResult<Value> {
        let mut state = self.inner.state.lock();
        self.ensure_loaded(&mut state, uid);

        let Some(idx) = state.store.get_mut(uid, device_id) else {
            return Err(ServiceError::Usage(format!(
                "no index for device '{device_id}'"
            )));
        };

        let out: Vec<Value> = dir_ids
            .iter()
            .map(|&dir_id| json!([dir_id, idx.dir_path(dir_id)]))
            .collect();
        Ok(Value::Array(out))
    }

    pub fn resolve_entries(&self, uid: u32, entry_ids: &[u64]) -> Value {
        let known = devices::list_known_devices();

        let mut state = self.inner.state.lock();
        self.ensure_loaded(&mut state, uid);

        let hash_to_device: HashMap<u32, String> = state
            .store
            .devices_for(uid)
            .map(|devices| {
                devices
                    .keys()
                    .map(|id| (query::device_hash32(id), id.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut out = Vec::new();
        for &entry_id in entry_ids {
            let (hash, record_idx) = query::split_entry_id(entry_id);
            let Some(device_id) = hash_to_device.get(&hash).cloned() else {
                continue;
            };
            let Some(idx) = state.store.get_mut(uid, &device_id) else {
                continue;
            };
            if record_idx as usize >= idx.len() {
                continue;
            }

            let rec = idx.records[record_idx as usize];
            let name = String::from_utf8_lossy(idx.name_of(record_idx)).into_owned();
            let internal_dir = idx.dir_path(rec.parent_record_idx);
            let internal_path = join_internal_path(&internal_dir, &name);

            let dev = devices::find_device(&known, &device_id);
            let mounted = dev.as_ref().is_some_and(KnownDevice::mounted);
            let primary = dev
                .as_ref()
                .map(|d| d.primary_mount_point.clone())
                .unwrap_or_default();

            let display_prefix = if mounted {
                primary.clone()
            } else {
                let idx_ref = state.store.get(uid, &device_id);
                let label = idx_ref
                    .map(|i| i.label_last_known.clone())
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| device_id.clone());
                format!("[{label}]")
            };

            out.push(json!({
                "entryId": entry_id,
                "deviceId": device_id,
                "name": name,
                "isDir": rec.is_dir(),
                "mounted": mounted,
                "primaryMountPoint": primary,
                "internalPath": internal_path,
                "displayPath": format!("{display_prefix}{internal_path}"),
                "internalDir": internal_dir,
                "displayDir": format!("{display_prefix}{internal_dir}"),
            }));
        }

        Value::Array(out)
    }

    pub fn forget_index(&self, uid: u32, device_id: &str) -> ServiceResult<()> {
        {
            let mut state = self.inner.state.lock();
            self.ensure_loaded(&mut state, uid);

            if state
                .jobs
                .values()
                .any(|j| j.owner_uid == uid && j.device_id == device_id)
            {
                return Err(ServiceError::Usage(format!(
                    "an indexing job for '{device_id}' is still running"
                )));
            }
            if !state.store.forget(uid, device_id) {
                return Err(ServiceError::Usage(format!(
                    "no index for device '{device_id}'"
                )));
            }
        }

        let path = snapshot::snapshot_path(&self.inner.config.state_dir, uid, device_id);
        if let Err(e) = snapshot::remove(&path) {
            tracing::warn!("failed to delete snapshot for {device_id}: {e:#}");
        }

        self.emit(Signal::DeviceIndexRemoved {
            device_id: device_id.to_string(),
        });
        self.refresh_watches_for_uid(uid);
        Ok(())
    }

    pub fn set_watch_enabled(&self, uid: u32, device_id: &str, enabled: bool) -> bool {
        {
            let mut state = self.inner.state.lock();
            let key = (uid, device_id.to_string());
            if enabled {
                state.watch_enabled.insert(key);
            } else {
                state.watch_enabled.remove(&key);
            }
        }
        self.refresh_watches_for_uid(uid);
        true
    }

    // ---- job lifecycle callbacks --------------------------------------

    pub(crate) fn set_job_pid(&self, job_id: u64, pid: u32) {
        let mut state = self.inner.state.lock();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.pid = Some(pid);
        }
    }

    /// Progress from the child's stderr: deduplicated, suppressed while
    /// cancelling.
    pub(crate) fn job_progress(&self, job_id: u64, percent: u32) {
        let props = {
            let mut state = self.inner.state.lock();
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return;
            };
            if job.state == JobState::Cancelling || job.last_pct == percent as i32 {
                return;
            }
            job.last_pct = percent as i32;
            json!({
                "deviceId": job.device_id,
                "devNode": job.dev_node.to_string_lossy(),
                "fsType": job.fs_type.name(),
            })
        };
        self.emit(Signal::JobProgress {
            job_id,
            percent,
            props,
        });
    }

    pub(crate) fn finish_spawn_failure(&self, job_id: u64, message: &str) {
        let props = {
            let mut state = self.inner.state.lock();
            let Some(job) = state.jobs.remove(&job_id) else {
                return;
            };
            json!({
                "deviceId": job.device_id,
                "devNode": job.dev_node.to_string_lossy(),
                "fsType": job.fs_type.name(),
            })
        };
        self.emit(Signal::JobFinished {
            job_id,
            status: JobStatus::Error,
            message: format!("failed to spawn scanner: {message}"),
            props,
        });
    }

    /// The single terminal site: classifies the child exit, installs the
    /// index on success, and emits exactly one `JobFinished`.
    pub(crate) fn finish_job(&self, job_id: u64, exit: ExitInfo, stdout_buf: Vec<u8>) {
        let (uid, device_id, fs_type, props, outcome) = {
            let state = self.inner.state.lock();
            let Some(job) = state.jobs.get(&job_id) else {
                return;
            };
            (
                job.owner_uid,
                job.device_id.clone(),
                job.fs_type,
                json!({
                    "deviceId": job.device_id,
                    "devNode": job.dev_node.to_string_lossy(),
                    "fsType": job.fs_type.name(),
                }),
                classify_outcome(job.state, exit),
            )
        };

        let finish_with = |status: JobStatus, message: String| {
            self.inner.state.lock().jobs.remove(&job_id);
            tracing::info!(job_id, ?status, "{message}");
            self.emit(Signal::JobFinished {
                job_id,
                status,
                message,
                props: props.clone(),
            });
        };

        match outcome {
            Outcome::Cancelled => {
                finish_with(JobStatus::Cancelled, "Cancelled by request".into());
            }
            Outcome::Crashed => {
                finish_with(JobStatus::Error, "Scanner helper crashed".into());
            }
            Outcome::Failed(code) => {
                finish_with(
                    JobStatus::Error,
                    format!("Scanner helper failed (exit code {code})"),
                );
            }
            Outcome::Completed => {
                let payload = match kerything_core::payload::parse_payload(
                    &mut stdout_buf.as_slice(),
                ) {
                    Ok(p) => p,
                    Err(e) => {
                        finish_with(
                            JobStatus::Error,
                            format!("Failed to parse scan output: {e}"),
                        );
                        return;
                    }
                };

                // Heavy build happens outside the lock; the install itself
                // is one locked step.
                let known = devices::list_known_devices();
                let dev = devices::find_device(&known, &device_id);

                let mut idx = DeviceIndex::build(fs_type, payload);
                idx.last_indexed_time = unix_now();

                let (generation, entry_count) = {
                    let mut state = self.inner.state.lock();

                    if let Some(d) = &dev {
                        idx.label_last_known = d.label.clone();
                        idx.uuid_last_known = d.uuid.clone();
                    } else if let Some(prev) = state.store.get(uid, &device_id) {
                        idx.label_last_known = prev.label_last_known.clone();
                        idx.uuid_last_known = prev.uuid_last_known.clone();
                    }

                    let entry_count = idx.len() as u64;
                    let generation = state.store.install(uid, &device_id, idx);

                    let path =
                        snapshot::snapshot_path(&self.inner.config.state_dir, uid, &device_id);
                    if let Some(installed) = state.store.get(uid, &device_id) {
                        if let Err(e) = snapshot::save(&path, &device_id, installed) {
                            tracing::warn!("failed to persist snapshot: {e:#}");
                        }
                    }

                    state.jobs.remove(&job_id);
                    (generation, entry_count)
                };

                self.emit(Signal::JobProgress {
                    job_id,
                    percent: 100,
                    props: props.clone(),
                });
                self.emit(Signal::JobFinished {
                    job_id,
                    status: JobStatus::Ok,
                    message: format!("Indexed {entry_count} entries (generation {generation})"),
                    props: props.clone(),
                });
                self.emit(Signal::DeviceIndexUpdated {
                    device_id: device_id.clone(),
                    generation,
                    entry_count,
                });
                tracing::info!(
                    job_id,
                    device_id = %device_id,
                    generation,
                    entry_count,
                    "index installed"
                );

                self.refresh_watches_for_uid(uid);
            }
        }
    }

    // ---- watch supervision --------------------------------------------

    /// Re-evaluates every watch target of a uid: tears down unwanted
    /// entries, marks unmounted devices, re-arms on mount change, and
    /// respects backoff for failed targets.
    pub fn refresh_watches_for_uid(&self, uid: u32) {
        let known = devices::list_known_devices();
        let now = watch::now_ms();

        let mut state = self.inner.state.lock();
        let state = &mut *state;

        let targets: Vec<(String, String)> = state
            .store
            .devices_for(uid)
            .map(|devices| {
                devices
                    .keys()
                    .filter(|id| state.watch_enabled.contains(&(uid, (*id).clone())))
                    .map(|id| {
                        let mount = devices::find_device(&known, id)
                            .map(|d| d.primary_mount_point)
                            .unwrap_or_default();
                        (id.clone(), mount)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let wanted: HashSet<&String> = targets.iter().map(|(id, _)| id).collect();
        state.watch.entries.retain(|(entry_uid, device_id), entry| {
            if *entry_uid != uid || wanted.contains(device_id) {
                true
            } else {
                entry.stop();
                false
            }
        });

        for (device_id, mount_point) in targets {
            let key: WatchKey = (uid, device_id.clone());
            let epoch = state.watch.next_epoch();
            let entry = state.watch.entries.entry(key.clone()).or_default();

            if mount_point.trim().is_empty() {
                entry.stop();
                entry.status = WatchStatus::NotMounted;
                entry.mount_point.clear();
                // an unmounted device gets a fresh attempt on next mount
                entry.reset_backoff();
                continue;
            }

            let mount_changed = entry.mount_point != mount_point;
            if mount_changed {
                entry.reset_backoff();
            }

            if !mount_changed && entry.armed() {
                entry.status = WatchStatus::Watching;
                continue;
            }
            if !mount_changed && matches!(entry.status, WatchStatus::Error(_)) {
                if entry.retry_only_on_mount_change {
                    continue;
                }
                if entry.next_retry_at_ms > now {
                    continue;
                }
            }

            entry.stop();
            entry.mount_point = mount_point.clone();

            match watch::try_arm(&mount_point) {
                Ok((fd, mode)) => {
                    entry.epoch = epoch;
                    entry.mode = Some(mode);
                    entry.status = WatchStatus::Watching;
                    entry.reset_backoff();
                    entry.task = Some(tokio::spawn(watch::run_watch_reader(
                        self.clone(),
                        key.clone(),
                        fd,
                        epoch,
                    )));
                    tracing::info!(
                        uid,
                        device_id = %device_id,
                        mount_point = %mount_point,
                        mode = mode.name(),
                        "watch armed"
                    );
                }
                Err(arm_err) => {
                    tracing::warn!(
                        uid,
                        device_id = %device_id,
                        mount_point = %mount_point,
                        errno = arm_err.errno,
                        "watch arming failed: {}",
                        arm_err.message
                    );
                    entry.record_arm_failure(arm_err.errno, arm_err.message, now);
                }
            }
        }
    }

    /// Periodic tick: refresh every uid that owns indexes (also covers
    /// mount changes and expired retry backoffs).
    pub fn refresh_all_watches(&self) {
        let uids: Vec<u32> = {
            let state = self.inner.state.lock();
            state
                .watch_enabled
                .iter()
                .map(|(uid, _)| *uid)
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };
        for uid in uids {
            self.refresh_watches_for_uid(uid);
        }
    }

    /// Merges freshly drained events into the target's pending batch.
    /// Returns true when the quiet timer should be (re)armed.
    pub(crate) fn watch_merge_events(
        &self,
        key: &WatchKey,
        epoch: u64,
        events: watch::ParsedEvents,
    ) -> bool {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.watch.entries.get_mut(key) else {
            return false;
        };
        if entry.epoch != epoch {
            return false;
        }

        if events.overflow {
            entry.overflow_seen = true;
        }

        let had_tokens = !events.touched.is_empty();
        for touched in events.touched {
            let merged = entry.pending.entry(touched.key()).or_default();
            let mask = touched.mask;
            *merged = watch::PendingTouched {
                mask: merged.mask | mask,
                ..touched
            };
        }

        // Fallback-mode events carry no DFID_NAME info; a generic token
        // still forces a rescan.
        if events.saw_non_overflow && !had_tokens {
            let generic = entry
                .pending
                .entry(":: *".to_string())
                .or_insert_with(|| watch::PendingTouched {
                    name: "*".to_string(),
                    ..watch::PendingTouched::default()
                });
            generic.mask |= 1;
        }

        events.overflow || events.saw_non_overflow
    }

    /// Quiet-timer expiry: delivers the coalesced batch in one dispatch.
    /// The whole device is re-scanned for any non-empty batch or overflow.
    pub(crate) fn watch_dispatch(&self, key: &WatchKey, epoch: u64) {
        let (uid, device_id) = key;

        let should_rescan = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.watch.entries.get_mut(key) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            let count = entry.pending.len();
            let overflow = entry.overflow_seen;
            entry.pending.clear();
            entry.overflow_seen = false;

            tracing::info!(
                uid,
                device_id = %device_id,
                touched = count,
                overflow,
                "watch batch dispatched"
            );
            count > 0 || overflow
        };

        if should_rescan {
            match self.start_index(*uid, device_id) {
                Ok(job_id) => {
                    tracing::info!(job_id, device_id = %device_id, "watch-triggered rescan");
                }
                Err(e) => tracing::debug!(device_id = %device_id, "watch rescan skipped: {e}"),
            }
        }
    }

    pub(crate) fn watch_read_error(&self, key: &WatchKey, epoch: u64, message: &str) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.watch.entries.get_mut(key) {
            if entry.epoch == epoch {
                entry.status = WatchStatus::Error(format!("fanotify read failed: {message}"));
            }
        }
    }

    // ---- test hooks ---------------------------------------------------

    #[cfg(test)]
    pub(crate) fn install_for_test(&self, uid: u32, device_id: &str, idx: DeviceIndex) -> u64 {
        let mut state = self.inner.state.lock();
        state.loaded_uids.insert(uid);
        state.store.install(uid, device_id, idx)
    }

    #[cfg(test)]
    pub(crate) fn insert_job_for_test(
        &self,
        device_id: &str,
        uid: u32,
        job_state: JobState,
    ) -> u64 {
        let mut state = self.inner.state.lock();
        let job_id = state.next_job_id;
        state.next_job_id += 1;
        state.jobs.insert(
            job_id,
            Job {
                job_id,
                owner_uid: uid,
                device_id: device_id.to_string(),
                dev_node: PathBuf::from("/dev/test0"),
                fs_type: FsType::Ext4,
                state: job_state,
                pid: None,
                last_pct: 0,
            },
        );
        job_id
    }

    #[cfg(test)]
    pub(crate) fn index_generation(&self, uid: u32, device_id: &str) -> Option<u64> {
        let state = self.inner.state.lock();
        state.store.get(uid, device_id).map(|i| i.generation)
    }

    // ---- shutdown -----------------------------------------------------

    /// Drains scanner children at shutdown: terminate, grace, kill.
    pub async fn shutdown_children(&self) {
        let pids: Vec<u32> = {
            let mut state = self.inner.state.lock();
            state
                .jobs
                .values_mut()
                .filter_map(|job| {
                    job.state = JobState::Cancelling;
                    job.pid
                })
                .collect()
        };
        if pids.is_empty() {
            return;
        }

        tracing::info!("terminating {} scanner child(ren)", pids.len());
        for &pid in &pids {
            jobs::signal_pid(pid, libc::SIGTERM);
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let survivors: Vec<u32> = {
            let state = self.inner.state.lock();
            state.jobs.values().filter_map(|j| j.pid).collect()
        };
        for &pid in &survivors {
            jobs::signal_pid(pid, libc::SIGKILL);
        }
        if !survivors.is_empty() {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
}

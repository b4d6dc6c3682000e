//! Scanner child processes and job lifecycle.
//!
//! One job per `StartIndex`: spawn the scanner, buffer its stdout (the
//! binary payload), parse `KERYTHING_PROGRESS` lines off stderr, and
//! classify the outcome exactly once when the child exits. Cancellation
//! only transitions state and signals the child; the exit handler is the
//! single place that emits `JobFinished`.

use kerything_core::types::FsType;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

pub const PROGRESS_PREFIX: &str = "KERYTHING_PROGRESS ";

/// Grace between SIGTERM and SIGKILL on cancel.
pub const CANCEL_KILL_GRACE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Cancelling,
}

#[derive(Debug)]
pub struct Job {
    pub job_id: u64,
    pub owner_uid: u32,
    pub device_id: String,
    pub dev_node: PathBuf,
    pub fs_type: FsType,
    pub state: JobState,
    pub pid: Option<u32>,
    /// Last percent emitted to clients; -1 until the first emission.
    pub last_pct: i32,
}

/// How the child ended, as seen by `wait()`.
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signaled: bool,
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signaled: status.code().is_none(),
        }
    }
}

/// Terminal classification, decided once from the exit handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Cancelled,
    Crashed,
    Failed(i32),
    Completed,
}

pub fn classify_outcome(state: JobState, exit: ExitInfo) -> Outcome {
    if state == JobState::Cancelling {
        return Outcome::Cancelled;
    }
    if exit.signaled {
        return Outcome::Crashed;
    }
    match exit.code {
        Some(0) => Outcome::Completed,
        Some(code) => Outcome::Failed(code),
        None => Outcome::Crashed,
    }
}

/// Parses one stderr line into a clamped percent, if it is a progress line.
pub fn parse_progress_line(line: &str) -> Option<u32> {
    let rest = line.strip_prefix(PROGRESS_PREFIX)?;
    let pct: i64 = rest.trim().parse().ok()?;
    Some(pct.clamp(0, 100) as u32)
}

/// Sends `signal` to a process; failures (already gone) are ignored.
pub fn signal_pid(pid: u32, signal: i32) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

/// Drives one scanner child from spawn to terminal classification.
pub(crate) async fn run_job(
    daemon: crate::service::Daemon,
    job_id: u64,
    dev_node: PathBuf,
    fs_type: FsType,
) {
    let scanner = daemon.scanner_path().to_path_buf();
    let mut child = match Command::new(&scanner)
        .arg(&dev_node)
        .arg(fs_type.name())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            daemon.finish_spawn_failure(job_id, &format!("{}: {e}", scanner.display()));
            return;
        }
    };

    if let Some(pid) = child.id() {
        daemon.set_job_pid(job_id, pid);
    }

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        daemon.finish_spawn_failure(job_id, "scanner pipes unavailable");
        return;
    };

    let stdout_task = async {
        let mut buf = Vec::new();
        let mut stdout = stdout;
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    };

    let stderr_task = async {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(pct) = parse_progress_line(&line) {
                daemon.job_progress(job_id, pct);
            }
        }
    };

    let (stdout_buf, ()) = tokio::join!(stdout_task, stderr_task);

    let exit = match child.wait().await {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            tracing::warn!(job_id, "wait() on scanner failed: {e}");
            ExitInfo {
                code: None,
                signaled: true,
            }
        }
    };

    daemon.finish_job(job_id, exit, stdout_buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_parse_and_clamp() {
        assert_eq!(parse_progress_line("KERYTHING_PROGRESS 42"), Some(42));
        assert_eq!(parse_progress_line("KERYTHING_PROGRESS  7 "), Some(7));
        assert_eq!(parse_progress_line("KERYTHING_PROGRESS 150"), Some(100));
        assert_eq!(parse_progress_line("KERYTHING_PROGRESS -5"), Some(0));
        assert_eq!(parse_progress_line("KERYTHING_PROGRESS x"), None);
        assert_eq!(parse_progress_line("scanning /dev/sda1"), None);
    }

    #[test]
    fn cancelling_wins_over_any_exit() {
        let exit_ok = ExitInfo {
            code: Some(0),
            signaled: false,
        };
        assert_eq!(
            classify_outcome(JobState::Cancelling, exit_ok),
            Outcome::Cancelled
        );
        let exit_sig = ExitInfo {
            code: None,
            signaled: true,
        };
        assert_eq!(
            classify_outcome(JobState::Cancelling, exit_sig),
            Outcome::Cancelled
        );
    }

    #[test]
    fn signal_exit_is_a_crash() {
        let exit = ExitInfo {
            code: None,
            signaled: true,
        };
        assert_eq!(classify_outcome(JobState::Running, exit), Outcome::Crashed);
    }

    #[test]
    fn exit_codes_classify() {
        let ok = ExitInfo {
            code: Some(0),
            signaled: false,
        };
        assert_eq!(classify_outcome(JobState::Running, ok), Outcome::Completed);

        let failed = ExitInfo {
            code: Some(2),
            signaled: false,
        };
        assert_eq!(
            classify_outcome(JobState::Running, failed),
            Outcome::Failed(2)
        );
    }
}

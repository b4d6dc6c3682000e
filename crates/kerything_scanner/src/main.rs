//! Scanner host: `kerything-scanner <devicePath> <fsType>`.
//!
//! Wraps the raw decoders in a standalone executable. The index payload is
//! written to stdout as a binary stream; progress goes to stderr as
//! `KERYTHING_PROGRESS <pct>` lines (any other stderr output is log noise
//! the supervisor ignores). Exit codes are contractual: 0 success, 2 scan
//! error, 3 stdout write error, 64 usage, 65 device validation.

use kerything_core::payload::{write_payload, ScanPayload};
use kerything_core::types::FsType;
use kerything_fs::{ext4, ntfs, DiskReader};
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

const EXIT_SCAN_ERROR: u8 = 2;
const EXIT_WRITE_ERROR: u8 = 3;
const EXIT_USAGE: u8 = 64;
const EXIT_BAD_DEVICE: u8 = 65;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage(argv0: &str) {
    eprintln!(
        "Usage:\n  {argv0} --version\n  {argv0} <devicePath> <fsType>\n\
         Where:\n  <devicePath> is a block device path like /dev/sdXN or /dev/nvme0n1pN\n\
         <fsType> is one of: ntfs, ext4"
    );
}

/// Cheap shape checks that need no filesystem access: absolute and under
/// `/dev/`.
fn check_path_shape(input: &str) -> Result<(), String> {
    if input.is_empty() {
        return Err("empty device path".into());
    }
    let path = Path::new(input);
    if !path.is_absolute() {
        return Err(format!("device path must be absolute (got: {input})"));
    }
    if !input.starts_with("/dev/") {
        return Err(format!("device path must be under /dev (got: {input})"));
    }
    Ok(())
}

/// Full validation: resolve symlinks, require a non-world-writable block
/// device.
fn validate_device_path(input: &str) -> Result<PathBuf, String> {
    check_path_shape(input)?;

    let resolved = std::fs::canonicalize(input)
        .map_err(|e| format!("failed to resolve device path '{input}': {e}"))?;

    let meta = std::fs::metadata(&resolved)
        .map_err(|e| format!("stat() failed for '{}': {e}", resolved.display()))?;

    if !meta.file_type().is_block_device() {
        return Err(format!("'{}' is not a block device", resolved.display()));
    }
    if meta.mode() & 0o002 != 0 {
        return Err(format!(
            "refusing world-writable device node '{}'",
            resolved.display()
        ));
    }

    Ok(resolved)
}

/// Rate-limited percent reporter: at most one line per interval, only on
/// integer-percent change, and 100% exactly once.
struct ProgressReporter {
    min_interval: Duration,
    next_emit: Instant,
    last_pct: Option<u8>,
}

impl ProgressReporter {
    fn new() -> Self {
        Self::with_interval(Duration::from_millis(100))
    }

    fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_emit: Instant::now(),
            last_pct: None,
        }
    }

    /// Returns the percent to emit, if any.
    fn observe(&mut self, done: u64, total: u64) -> Option<u8> {
        let total = total.max(1);
        let done = done.min(total);

        if done == total {
            if self.last_pct == Some(100) {
                return None;
            }
            self.last_pct = Some(100);
            return Some(100);
        }

        let now = Instant::now();
        if now < self.next_emit {
            return None;
        }
        self.next_emit = now + self.min_interval;

        let pct = ((done * 100 + total / 2) / total) as u8;
        if self.last_pct == Some(pct) {
            return None;
        }
        self.last_pct = Some(pct);
        Some(pct)
    }

    fn report(&mut self, done: u64, total: u64) {
        if let Some(pct) = self.observe(done, total) {
            eprintln!("KERYTHING_PROGRESS {pct}");
        }
    }
}

fn run_scan(device_path: &Path, fs_type: FsType) -> u8 {
    let mut reader = match DiskReader::open(device_path) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("failed to open {}: {e}", device_path.display());
            return EXIT_SCAN_ERROR;
        }
    };

    let mut reporter = ProgressReporter::new();
    let mut progress = |done: u64, total: u64| reporter.report(done, total);

    let payload: ScanPayload = match fs_type {
        FsType::Ntfs => match ntfs::parse_mft(&mut reader, &mut progress) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("NTFS scan failed: {e}");
                return EXIT_SCAN_ERROR;
            }
        },
        FsType::Ext4 => match ext4::parse_inodes(&mut reader, &mut progress) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("ext4 scan failed: {e}");
                return EXIT_SCAN_ERROR;
            }
        },
    };

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::with_capacity(4 * 1024 * 1024, stdout.lock());
    if let Err(e) = write_payload(&mut out, &payload) {
        tracing::error!("failed writing payload to stdout: {e}");
        return EXIT_WRITE_ERROR;
    }
    if let Err(e) = out.flush() {
        tracing::error!("failed flushing stdout: {e}");
        return EXIT_WRITE_ERROR;
    }

    0
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let argv0 = args.first().map(String::as_str).unwrap_or("kerything-scanner");

    if args.len() == 2 && args[1] == "--version" {
        println!("kerything-scanner v{VERSION}");
        return ExitCode::SUCCESS;
    }

    if args.len() != 3 {
        print_usage(argv0);
        return ExitCode::from(EXIT_USAGE);
    }

    let fs_type: FsType = match args[2].parse() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: {e}");
            print_usage(argv0);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let device_path = match validate_device_path(&args[1]) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_BAD_DEVICE);
        }
    };

    tracing::info!("scanning {} ({fs_type})", device_path.display());
    ExitCode::from(run_scan(&device_path, fs_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_shape_rules() {
        assert!(check_path_shape("/dev/sda1").is_ok());
        assert!(check_path_shape("").is_err());
        assert!(check_path_shape("dev/sda1").is_err());
        assert!(check_path_shape("/tmp/sda1").is_err());
    }

    #[test]
    fn progress_emits_completion_exactly_once() {
        let mut r = ProgressReporter::with_interval(Duration::ZERO);
        assert_eq!(r.observe(10, 10), Some(100));
        assert_eq!(r.observe(10, 10), None);
    }

    #[test]
    fn progress_dedupes_unchanged_percent() {
        let mut r = ProgressReporter::with_interval(Duration::ZERO);
        assert_eq!(r.observe(1, 100), Some(1));
        assert_eq!(r.observe(1, 100), None);
        assert_eq!(r.observe(2, 100), Some(2));
    }

    #[test]
    fn progress_clamps_overshoot() {
        let mut r = ProgressReporter::with_interval(Duration::ZERO);
        assert_eq!(r.observe(20, 10), Some(100));
    }

    #[test]
    fn progress_rounds_to_nearest_percent() {
        let mut r = ProgressReporter::with_interval(Duration::ZERO);
        assert_eq!(r.observe(996, 1000), Some(100));
        // 100 was emitted by rounding; completion does not re-emit
        assert_eq!(r.observe(1000, 1000), None);
    }
}

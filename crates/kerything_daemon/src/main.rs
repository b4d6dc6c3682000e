//! kerythingd - the privileged indexing daemon.
//!
//! Single-process event loop (current-thread tokio runtime): request
//! dispatch, signal emission, scanner-child I/O and fanotify readiness all
//! run here; index building and query refinement use the rayon pool.

mod devices;
mod jobs;
mod protocol;
mod server;
mod service;
mod snapshot;
mod watch;

use anyhow::Context;
use clap::Parser;
use service::{Config, Daemon};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tokio::net::UnixListener;

#[derive(Parser)]
#[command(name = "kerythingd")]
#[command(version)]
#[command(about = "Kerything indexing daemon", long_about = None)]
struct Args {
    /// Unix socket to listen on
    #[arg(long, default_value = "/run/kerything/kerythingd.sock")]
    socket: PathBuf,

    /// Scanner helper executable
    #[arg(long, default_value = "/usr/bin/kerything-scanner")]
    scanner: PathBuf,

    /// Directory for persisted index snapshots
    #[arg(long, default_value = "/var/lib/kerything/index")]
    state_dir: PathBuf,

    /// Seconds between watch/mount refresh sweeps
    #[arg(long, default_value = "15")]
    watch_refresh_secs: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    std::fs::create_dir_all(&args.state_dir)
        .with_context(|| format!("creating state dir {}", args.state_dir.display()))?;
    if let Some(parent) = args.socket.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket dir {}", parent.display()))?;
    }

    // A previous instance may have left the socket file behind.
    match std::fs::remove_file(&args.socket) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("removing {}", args.socket.display())),
    }

    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("binding {}", args.socket.display()))?;
    // Unprivileged clients must be able to connect; authorization is
    // per-uid via peer credentials.
    std::fs::set_permissions(&args.socket, std::fs::Permissions::from_mode(0o666))?;

    let daemon = Daemon::new(Config {
        scanner_path: args.scanner,
        state_dir: args.state_dir,
    });

    // Periodic sweep: picks up mount changes and expired arming backoffs.
    {
        let daemon = daemon.clone();
        let period = std::time::Duration::from_secs(args.watch_refresh_secs.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                daemon.refresh_all_watches();
            }
        });
    }

    tracing::info!(
        socket = %args.socket.display(),
        "kerythingd {} listening",
        service::VERSION
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    tokio::select! {
        result = server::serve(daemon.clone(), listener) => {
            result.context("accept loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, shutting down");
        }
    }

    daemon.shutdown_children().await;
    let _ = std::fs::remove_file(&args.socket);
    Ok(())
}

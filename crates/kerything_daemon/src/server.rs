//! Unix-socket request loop.
//!
//! Each connection speaks newline-delimited JSON. The caller's uid comes
//! from `SO_PEERCRED` and keys every index operation; a connection that
//! sends `Subscribe` also receives the daemon's signal stream.

use crate::protocol::{ErrorKind, Request, RequestOp, Response};
use crate::service::Daemon;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

pub async fn serve(daemon: Daemon, listener: UnixListener) -> anyhow::Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let uid = match stream.peer_cred() {
            Ok(cred) => cred.uid(),
            Err(e) => {
                tracing::warn!("rejecting connection without peer credentials: {e}");
                continue;
            }
        };
        tokio::spawn(handle_connection(daemon.clone(), stream, uid));
    }
}

async fn handle_connection(daemon: Daemon, stream: UnixStream, uid: u32) {
    let (read_half, mut write_half) = stream.into_split();

    // Responses and signal frames share one ordered writer.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    let mut subscribed = false;

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Err(e) => Response::err(0, ErrorKind::Format, format!("bad request: {e}")),
            Ok(request) => {
                if matches!(request.op, RequestOp::Subscribe) {
                    if !subscribed {
                        subscribed = true;
                        spawn_signal_forwarder(&daemon, tx.clone());
                    }
                    Response::ok(request.id, json!({ "subscribed": true }))
                } else {
                    dispatch(&daemon, uid, request)
                }
            }
        };

        let Ok(encoded) = serde_json::to_string(&response) else {
            break;
        };
        if tx.send(encoded).is_err() {
            break;
        }
    }

    drop(tx);
    let _ = writer.await;
}

fn spawn_signal_forwarder(daemon: &Daemon, tx: mpsc::UnboundedSender<String>) {
    let mut signals = daemon.subscribe();
    tokio::spawn(async move {
        loop {
            match signals.recv().await {
                Ok(signal) => {
                    let Ok(encoded) = serde_json::to_string(&signal) else {
                        continue;
                    };
                    if tx.send(encoded).is_err() {
                        return;
                    }
                }
                // A slow client skipped some signals; keep streaming.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("signal subscriber lagged by {n}");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn dispatch(daemon: &Daemon, uid: u32, request: Request) -> Response {
    let id = request.id;
    match request.op {
        RequestOp::Ping => Response::ok(id, daemon.ping()),
        RequestOp::Subscribe => Response::ok(id, json!({ "subscribed": true })),
        RequestOp::ListKnownDevices => Response::ok(id, daemon.list_known_devices()),
        RequestOp::ListIndexedDevices => Response::ok(id, daemon.list_indexed_devices(uid)),
        RequestOp::StartIndex { device_id } => match daemon.start_index(uid, &device_id) {
            Ok(job_id) => Response::ok(id, json!({ "jobId": job_id })),
            Err(e) => Response::err(id, e.kind(), e.to_string()),
        },
        RequestOp::CancelJob { job_id } => {
            daemon.cancel_job(job_id);
            Response::ok(id, json!({}))
        }
        RequestOp::Search {
            query,
            device_ids,
            sort_key,
            sort_dir,
            offset,
            limit,
            options: _,
        } => Response::ok(
            id,
            daemon.search(uid, &query, &device_ids, &sort_key, &sort_dir, offset, limit),
        ),
        RequestOp::ResolveDirectories { device_id, dir_ids } => {
            match daemon.resolve_directories(uid, &device_id, &dir_ids) {
                Ok(v) => Response::ok(id, v),
                Err(e) => Response::err(id, e.kind(), e.to_string()),
            }
        }
        RequestOp::ResolveEntries { entry_ids } => {
            Response::ok(id, daemon.resolve_entries(uid, &entry_ids))
        }
        RequestOp::ForgetIndex { device_id } => match daemon.forget_index(uid, &device_id) {
            Ok(()) => Response::ok(id, json!({})),
            Err(e) => Response::err(id, e.kind(), e.to_string()),
        },
        RequestOp::SetWatchEnabled { device_id, enabled } => Response::ok(
            id,
            json!({ "ok": daemon.set_watch_enabled(uid, &device_id, enabled) }),
        ),
    }
}

//! kerything - line-protocol client for kerythingd.
//!
//! A debugging and scripting surface over the daemon socket; the search
//! output mirrors the wire rows (entry id, device, name, size, mtime).

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use humansize::{format_size, BINARY};
use kerything_core::time::{display_mtime, DisplayTime};
use kerything_core::types::FsType;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kerything")]
#[command(version)]
#[command(about = "Query the Kerything file-name index", long_about = None)]
struct Cli {
    /// Daemon socket path
    #[arg(long, default_value = "/run/kerything/kerythingd.sock")]
    socket: PathBuf,

    /// Print raw JSON responses instead of formatted output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check daemon liveness and version
    Ping,

    /// List partitions the daemon can see
    Devices,

    /// List devices with a live index
    Indexed,

    /// Start indexing a device and stream its progress
    Index {
        device_id: String,

        /// Return immediately with the job id instead of following
        #[arg(long)]
        no_follow: bool,
    },

    /// Cancel a running job
    Cancel { job_id: u64 },

    /// Search indexed devices
    Search {
        query: Vec<String>,

        /// Restrict to specific device ids
        #[arg(short, long)]
        device: Vec<String>,

        /// Sort key: name, path, size or mtime
        #[arg(short, long, default_value = "name")]
        sort: String,

        /// Sort descending
        #[arg(long)]
        desc: bool,

        #[arg(long, default_value = "0")]
        offset: u32,

        #[arg(short, long, default_value = "100")]
        limit: u32,
    },

    /// Resolve directory ids to paths
    ResolveDirs {
        device_id: String,
        dir_ids: Vec<u32>,
    },

    /// Resolve search-result entry ids to full paths
    ResolveEntries { entry_ids: Vec<u64> },

    /// Drop a device index (and its persisted snapshot)
    Forget { device_id: String },

    /// Enable or disable live watching for a device
    Watch {
        device_id: String,
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
}

struct Client {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_id: u64,
}

impl Client {
    fn connect(socket: &PathBuf) -> Result<Self> {
        let stream = UnixStream::connect(socket)
            .with_context(|| format!("connecting to {} (is kerythingd running?)", socket.display()))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: stream,
            next_id: 1,
        })
    }

    fn send(&mut self, op: &str, args: Value) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let frame = if args.is_null() {
            json!({ "id": id, "op": op })
        } else {
            json!({ "id": id, "op": op, "args": args })
        };
        writeln!(self.writer, "{frame}")?;
        Ok(id)
    }

    fn read_frame(&mut self) -> Result<Value> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                bail!("daemon closed the connection");
            }
            if line.trim().is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(&line)?);
        }
    }

    /// Sends a request and waits for its response, skipping signal frames.
    fn request(&mut self, op: &str, args: Value) -> Result<Value> {
        let id = self.send(op, args)?;
        loop {
            let frame = self.read_frame()?;
            if frame.get("signal").is_some() {
                continue;
            }
            if frame.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(err) = frame.get("error") {
                bail!(
                    "{}: {}",
                    err.get("kind").and_then(Value::as_str).unwrap_or("error"),
                    err.get("message").and_then(Value::as_str).unwrap_or("?")
                );
            }
            return frame
                .get("result")
                .cloned()
                .ok_or_else(|| anyhow!("malformed response"));
        }
    }
}

fn mtime_text(fs_type: Option<FsType>, raw: i64) -> String {
    let Some(fs_type) = fs_type else {
        return raw.to_string();
    };
    match display_mtime(fs_type, raw as u64) {
        DisplayTime::Unknown => "N/A".to_string(),
        DisplayTime::OutOfRange => "out-of-range".to_string(),
        DisplayTime::Unix(secs) => secs.to_string(),
    }
}

/// deviceId -> fsType for rendering mtimes per source filesystem.
fn fs_type_map(client: &mut Client) -> Result<HashMap<String, FsType>> {
    let indexed = client.request("ListIndexedDevices", Value::Null)?;
    let mut map = HashMap::new();
    for dev in indexed.as_array().into_iter().flatten() {
        let (Some(id), Some(fs)) = (
            dev.get("deviceId").and_then(Value::as_str),
            dev.get("fsType").and_then(Value::as_str),
        ) else {
            continue;
        };
        if let Ok(fs_type) = fs.parse::<FsType>() {
            map.insert(id.to_string(), fs_type);
        }
    }
    Ok(map)
}

fn run_search(
    client: &mut Client,
    json_output: bool,
    query: &str,
    device: Vec<String>,
    sort: String,
    desc: bool,
    offset: u32,
    limit: u32,
) -> Result<()> {
    let fs_types = if json_output {
        HashMap::new()
    } else {
        fs_type_map(client)?
    };

    let result = client.request(
        "Search",
        json!({
            "query": query,
            "deviceIds": device,
            "sortKey": sort,
            "sortDir": if desc { "desc" } else { "asc" },
            "offset": offset,
            "limit": limit,
        }),
    )?;

    if json_output {
        println!("{result:#}");
        return Ok(());
    }

    let total = result.get("totalHits").and_then(Value::as_u64).unwrap_or(0);
    let rows = result
        .get("rows")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for row in &rows {
        let Some(fields) = row.as_array() else {
            continue;
        };
        if fields.len() != 7 {
            continue;
        }
        let device_id = fields[1].as_str().unwrap_or("?");
        let name = fields[2].as_str().unwrap_or("?");
        let size = fields[4].as_u64().unwrap_or(0);
        let mtime = fields[5].as_i64().unwrap_or(0);
        let flags = fields[6].as_u64().unwrap_or(0);

        let kind = if flags & 1 != 0 {
            "d"
        } else if flags & 2 != 0 {
            "l"
        } else {
            "-"
        };
        println!(
            "{kind} {:>10} {:>13} {:<28} {}",
            format_size(size, BINARY),
            mtime_text(fs_types.get(device_id).copied(), mtime),
            device_id,
            name,
        );
    }
    println!("{} of {total} hit(s)", rows.len());
    Ok(())
}

fn follow_job(client: &mut Client, job_id: u64) -> Result<()> {
    loop {
        let frame = client.read_frame()?;
        let Some(signal) = frame.get("signal").and_then(Value::as_str) else {
            continue;
        };
        if frame.get("jobId").and_then(Value::as_u64) != Some(job_id) {
            continue;
        }
        match signal {
            "JobProgress" => {
                let pct = frame.get("percent").and_then(Value::as_u64).unwrap_or(0);
                eprint!("\r{pct:>3}%");
                std::io::stderr().flush().ok();
            }
            "JobFinished" => {
                let status = frame.get("status").and_then(Value::as_str).unwrap_or("?");
                let message = frame.get("message").and_then(Value::as_str).unwrap_or("");
                eprintln!();
                println!("{status}: {message}");
                if status != "ok" {
                    std::process::exit(1);
                }
                return Ok(());
            }
            _ => {}
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut client = Client::connect(&cli.socket)?;

    match cli.command {
        Commands::Ping => {
            let result = client.request("Ping", Value::Null)?;
            println!("{result:#}");
        }
        Commands::Devices => {
            let result = client.request("ListKnownDevices", Value::Null)?;
            if cli.json {
                println!("{result:#}");
            } else {
                for dev in result.as_array().into_iter().flatten() {
                    println!(
                        "{:<46} {:<16} {:<5} {}",
                        dev.get("deviceId").and_then(Value::as_str).unwrap_or("?"),
                        dev.get("devNode").and_then(Value::as_str).unwrap_or("?"),
                        dev.get("fsType").and_then(Value::as_str).unwrap_or(""),
                        dev.get("primaryMountPoint")
                            .and_then(Value::as_str)
                            .unwrap_or(""),
                    );
                }
            }
        }
        Commands::Indexed => {
            let result = client.request("ListIndexedDevices", Value::Null)?;
            if cli.json {
                println!("{result:#}");
            } else {
                for dev in result.as_array().into_iter().flatten() {
                    println!(
                        "{:<46} {:<5} gen {:<4} {:>9} entries  watch: {}",
                        dev.get("deviceId").and_then(Value::as_str).unwrap_or("?"),
                        dev.get("fsType").and_then(Value::as_str).unwrap_or(""),
                        dev.get("generation").and_then(Value::as_u64).unwrap_or(0),
                        dev.get("entryCount").and_then(Value::as_u64).unwrap_or(0),
                        dev.get("watchState").and_then(Value::as_str).unwrap_or("?"),
                    );
                }
            }
        }
        Commands::Index {
            device_id,
            no_follow,
        } => {
            if !no_follow {
                client.request("Subscribe", Value::Null)?;
            }
            let result = client.request("StartIndex", json!({ "deviceId": device_id }))?;
            let job_id = result
                .get("jobId")
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow!("malformed StartIndex response"))?;
            println!("job {job_id}");
            if !no_follow {
                follow_job(&mut client, job_id)?;
            }
        }
        Commands::Cancel { job_id } => {
            client.request("CancelJob", json!({ "jobId": job_id }))?;
            println!("cancel requested");
        }
        Commands::Search {
            query,
            device,
            sort,
            desc,
            offset,
            limit,
        } => {
            run_search(
                &mut client,
                cli.json,
                &query.join(" "),
                device,
                sort,
                desc,
                offset,
                limit,
            )?;
        }
        Commands::ResolveDirs { device_id, dir_ids } => {
            let result = client.request(
                "ResolveDirectories",
                json!({ "deviceId": device_id, "dirIds": dir_ids }),
            )?;
            if cli.json {
                println!("{result:#}");
            } else {
                for pair in result.as_array().into_iter().flatten() {
                    let Some(fields) = pair.as_array() else {
                        continue;
                    };
                    println!(
                        "{:>10}  {}",
                        fields.first().and_then(Value::as_u64).unwrap_or(0),
                        fields.get(1).and_then(Value::as_str).unwrap_or("?"),
                    );
                }
            }
        }
        Commands::ResolveEntries { entry_ids } => {
            let result =
                client.request("ResolveEntries", json!({ "entryIds": entry_ids }))?;
            if cli.json {
                println!("{result:#}");
            } else {
                for entry in result.as_array().into_iter().flatten() {
                    println!(
                        "{}  {}",
                        entry.get("entryId").and_then(Value::as_u64).unwrap_or(0),
                        entry
                            .get("displayPath")
                            .and_then(Value::as_str)
                            .unwrap_or("?"),
                    );
                }
            }
        }
        Commands::Forget { device_id } => {
            client.request("ForgetIndex", json!({ "deviceId": device_id }))?;
            println!("index forgotten");
        }
        Commands::Watch { device_id, state } => {
            let result = client.request(
                "SetWatchEnabled",
                json!({ "deviceId": device_id, "enabled": state == "on" }),
            )?;
            let ok = result.get("ok").and_then(Value::as_bool).unwrap_or(false);
            println!("watch {} for {device_id}: {}", state, if ok { "ok" } else { "failed" });
        }
    }

    Ok(())
}

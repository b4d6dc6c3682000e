//! Wire types for the daemon's line-framed JSON protocol.
//!
//! One request or response per line. Operation and signal names (and their
//! argument names) are contractual; clients send
//! `{"id": 1, "op": "Search", "args": {...}}` and receive either
//! `{"id": 1, "result": ...}` or `{"id": 1, "error": {"kind", "message"}}`.
//! Connections that issue `Subscribe` additionally receive signal frames
//! `{"signal": "JobProgress", ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub op: RequestOp,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", content = "args")]
pub enum RequestOp {
    Ping,
    /// Turns this connection into a signal listener.
    Subscribe,
    ListKnownDevices,
    ListIndexedDevices,
    #[serde(rename_all = "camelCase")]
    StartIndex { device_id: String },
    #[serde(rename_all = "camelCase")]
    CancelJob { job_id: u64 },
    #[serde(rename_all = "camelCase")]
    Search {
        #[serde(default)]
        query: String,
        #[serde(default)]
        device_ids: Vec<String>,
        #[serde(default)]
        sort_key: String,
        #[serde(default)]
        sort_dir: String,
        #[serde(default)]
        offset: u32,
        #[serde(default)]
        limit: u32,
        /// Accepted for forward compatibility; currently ignored.
        #[serde(default)]
        options: Value,
    },
    #[serde(rename_all = "camelCase")]
    ResolveDirectories {
        device_id: String,
        #[serde(default)]
        dir_ids: Vec<u32>,
    },
    #[serde(rename_all = "camelCase")]
    ResolveEntries {
        #[serde(default)]
        entry_ids: Vec<u64>,
    },
    #[serde(rename_all = "camelCase")]
    ForgetIndex { device_id: String },
    #[serde(rename_all = "camelCase")]
    SetWatchEnabled { device_id: String, enabled: bool },
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(WireError {
                kind,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Usage,
    Io,
    Format,
    ResourceLimit,
    Internal,
}

/// Broadcast frames pushed to subscribed connections.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "signal")]
pub enum Signal {
    #[serde(rename_all = "camelCase")]
    JobAdded { job_id: u64, props: Value },
    #[serde(rename_all = "camelCase")]
    JobProgress {
        job_id: u64,
        percent: u32,
        props: Value,
    },
    #[serde(rename_all = "camelCase")]
    JobFinished {
        job_id: u64,
        status: JobStatus,
        message: String,
        props: Value,
    },
    #[serde(rename_all = "camelCase")]
    DeviceIndexUpdated {
        device_id: String,
        generation: u64,
        entry_count: u64,
    },
    #[serde(rename_all = "camelCase")]
    DeviceIndexRemoved { device_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Ok,
    Cancelled,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_without_args_parses() {
        let req: Request = serde_json::from_str(r#"{"id": 3, "op": "Ping"}"#).unwrap();
        assert_eq!(req.id, 3);
        assert!(matches!(req.op, RequestOp::Ping));
    }

    #[test]
    fn search_request_fills_defaults() {
        let req: Request = serde_json::from_str(
            r#"{"id": 1, "op": "Search", "args": {"query": "foo", "limit": 50}}"#,
        )
        .unwrap();
        match req.op {
            RequestOp::Search {
                query,
                device_ids,
                sort_key,
                offset,
                limit,
                ..
            } => {
                assert_eq!(query, "foo");
                assert!(device_ids.is_empty());
                assert_eq!(sort_key, "");
                assert_eq!(offset, 0);
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn camel_case_arg_names() {
        let req: Request = serde_json::from_str(
            r#"{"id": 9, "op": "StartIndex", "args": {"deviceId": "partuuid:x"}}"#,
        )
        .unwrap();
        match req.op {
            RequestOp::StartIndex { device_id } => assert_eq!(device_id, "partuuid:x"),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn signals_serialize_with_tag() {
        let sig = Signal::DeviceIndexUpdated {
            device_id: "partuuid:x".into(),
            generation: 4,
            entry_count: 100,
        };
        let v: Value = serde_json::to_value(&sig).unwrap();
        assert_eq!(v["signal"], "DeviceIndexUpdated");
        assert_eq!(v["generation"], 4);
        assert_eq!(v["deviceId"], "partuuid:x");
    }

    #[test]
    fn job_status_renders_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            r#""cancelled""#
        );
    }

    #[test]
    fn error_response_shape() {
        let resp = Response::err(7, ErrorKind::Usage, "unknown deviceId");
        let v: Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["error"]["kind"], "usage");
        assert!(v.get("result").is_none());
    }
}

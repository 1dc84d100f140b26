//! JSONL audit logging for dispatched RPC calls.
//!
//! Every call is logged as a single line in
//! `{state_dir}/rpc-logs/YYYY-MM-DD.jsonl`. Best-effort: never panics or
//! fails the caller.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::ErrorCode;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcAuditEntry<'a> {
    ts: DateTime<Utc>,
    correlation_id: &'a Value,
    method: &'a str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<ErrorCode>,
    duration_ms: u64,
}

/// Log a single dispatched call to today's JSONL audit file.
///
/// Failures are silently ignored so they never affect the caller's control
/// flow.
pub fn log_rpc_call(
    state_dir: &Path,
    correlation_id: &Value,
    method: &str,
    code: Option<ErrorCode>,
    duration: Duration,
) {
    let now = Utc::now();
    let entry = RpcAuditEntry {
        ts: now,
        correlation_id,
        method,
        ok: code.is_none(),
        code,
        duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
    };

    let dir = crate::paths::rpc_logs_dir(state_dir);
    let _ = fs::create_dir_all(&dir);
    let path = dir.join(log_file_name(now));

    if let Ok(json) = serde_json::to_string(&entry) {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            let _ = writeln!(file, "{json}");
        }
    }
}

fn log_file_name(at: DateTime<Utc>) -> String {
    format!("{}.jsonl", at.format("%Y-%m-%d"))
}

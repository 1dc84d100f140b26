//! Host adapter that runs an external executable once per operation.
//!
//! The child is invoked as `program args... <operation>` with the project path
//! in `HARNESS_PROJECT` and the JSON params in `HARNESS_PARAMS`. It reports its
//! outcome as the last stdout line starting with [`RESULT_PREFIX`], carrying
//! `{"ok": true, "result": ...}` or `{"ok": false, "error": "...", "code": "..."}`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{HostAdapter, HostError};
use crate::error::ErrorCode;

pub const RESULT_PREFIX: &str = "__HARNESS_JSON__";

/// Longest stderr tail carried into an error message.
const STDERR_TAIL: usize = 400;

#[derive(Deserialize)]
struct HostReply {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<ErrorCode>,
}

#[derive(Debug, Clone)]
pub struct CommandHost {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandHost {
    pub fn new(program: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL);
    trimmed.chars().skip(skip).collect()
}

fn parse_reply(stdout: &[u8]) -> Option<HostReply> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(RESULT_PREFIX))
        .and_then(|payload| serde_json::from_str(payload.trim()).ok())
}

#[async_trait]
impl HostAdapter for CommandHost {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn invoke(
        &self,
        operation: &str,
        project: Option<&Path>,
        params: Value,
    ) -> Result<Value, HostError> {
        let params_json = serde_json::to_string(&params).map_err(|e| HostError::domain(e.to_string()))?;
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg(operation)
            .env("HARNESS_PARAMS", params_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(project) = project {
            command.env("HARNESS_PROJECT", project);
        }

        let child = command.spawn().map_err(|e| {
            HostError::Unavailable(format!("failed to launch {}: {e}", self.program.display()))
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(HostError::Unavailable(format!("host process failed: {e}"))),
            Err(_) => {
                return Err(HostError::Unavailable(format!(
                    "host did not answer '{operation}' within {}ms",
                    self.timeout.as_millis()
                )))
            }
        };

        tracing::debug!(operation, status = %output.status, "host command finished");

        match parse_reply(&output.stdout) {
            Some(reply) if reply.ok => Ok(reply.result),
            Some(reply) => Err(HostError::Domain {
                code: reply.code,
                message: reply
                    .error
                    .unwrap_or_else(|| format!("host reported failure for '{operation}'")),
            }),
            None if !output.status.success() => Err(HostError::domain(format!(
                "host exited with {} for '{operation}': {}",
                output.status,
                stderr_tail(&output.stderr)
            ))),
            None => Err(HostError::domain(format!(
                "host produced no {RESULT_PREFIX} line for '{operation}'"
            ))),
        }
    }
}

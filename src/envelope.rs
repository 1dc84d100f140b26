//! Request/response wire format for `POST /rpc`.
//!
//! Pure and stateless: decoding never touches bridge state, and the response
//! constructors are the only way to build an envelope, so `ok=false` always
//! carries an error and never a result.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, ErrorCode};

pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const PROTOCOL_MAJOR: u64 = 1;

/// Inbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    #[serde(default, alias = "correlationId")]
    pub id: Value,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Per-call timeout; the dispatcher default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

impl RpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
            protocol_version: Some(PROTOCOL_VERSION.to_string()),
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&AppError> for ErrorBody {
    fn from(e: &AppError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<ErrorBody> for AppError {
    fn from(body: ErrorBody) -> Self {
        AppError::from_code(body.code, body.message)
    }
}

/// Outbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub ok: bool,
    pub protocol_version: String,
    pub correlation_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl RpcResponse {
    pub fn success(correlation_id: Value, result: Value) -> Self {
        Self {
            ok: true,
            protocol_version: PROTOCOL_VERSION.to_string(),
            correlation_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(correlation_id: Value, error: &AppError) -> Self {
        Self {
            ok: false,
            protocol_version: PROTOCOL_VERSION.to_string(),
            correlation_id,
            result: None,
            error: Some(ErrorBody::from(error)),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    /// Collapse the envelope into a `Result`. An envelope that breaks the
    /// ok/error/result invariant is reported as a generic error.
    pub fn into_result(self) -> Result<Value, AppError> {
        match (self.ok, self.result, self.error) {
            (true, result, None) => Ok(result.unwrap_or(Value::Null)),
            (false, None, Some(error)) => Err(error.into()),
            _ => Err(AppError::generic("malformed response envelope")),
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthBody {
    pub ok: bool,
    pub protocol_version: String,
    pub status: String,
}

impl HealthBody {
    pub fn ok() -> Self {
        Self {
            ok: true,
            protocol_version: PROTOCOL_VERSION.to_string(),
            status: "ok".to_string(),
        }
    }
}

/// Major component of a semantic version string such as `"1.4.2"`.
pub fn major_version(version: &str) -> Option<u64> {
    version.trim().split('.').next()?.parse().ok()
}

/// Reject any protocol version whose major component differs from ours.
pub fn check_protocol_version(version: &str) -> Result<(), AppError> {
    match major_version(version) {
        Some(PROTOCOL_MAJOR) => Ok(()),
        Some(major) => Err(AppError::invalid_input(format!(
            "unsupported protocol major version {major} (bridge speaks {PROTOCOL_VERSION})"
        ))),
        None => Err(AppError::invalid_input(format!(
            "malformed protocolVersion: {version:?}"
        ))),
    }
}

/// Decode a raw request body. On failure the best-effort correlation id is
/// returned alongside the error so the response can still echo it.
pub fn decode_request(raw: &[u8]) -> Result<RpcRequest, (Value, AppError)> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| (Value::Null, AppError::invalid_input(format!("request is not valid JSON: {e}"))))?;

    let Some(object) = value.as_object() else {
        return Err((Value::Null, AppError::invalid_input("request must be a JSON object")));
    };
    let id = object
        .get("id")
        .or_else(|| object.get("correlationId"))
        .cloned()
        .unwrap_or(Value::Null);

    if !matches!(id, Value::Null | Value::String(_) | Value::Number(_)) {
        return Err((Value::Null, AppError::invalid_input("id must be a string or number")));
    }
    match object.get("method") {
        Some(Value::String(m)) if !m.is_empty() => {}
        _ => {
            return Err((id, AppError::invalid_input("method must be a non-empty string")));
        }
    }
    if let Some(params) = object.get("params") {
        if !params.is_null() && !params.is_object() {
            return Err((id, AppError::invalid_input("params must be a JSON object")));
        }
    }

    let mut request: RpcRequest = serde_json::from_value(value)
        .map_err(|e| (id.clone(), AppError::invalid_input(format!("malformed request: {e}"))))?;
    if request.params.is_null() {
        request.params = empty_params();
    }
    Ok(request)
}

pub fn encode_response(response: &RpcResponse) -> Vec<u8> {
    serde_json::to_vec(response).unwrap_or_else(|_| {
        br#"{"ok":false,"protocolVersion":"1.0.0","correlationId":null,"error":{"code":"ERROR","message":"failed to encode response"}}"#
            .to_vec()
    })
}

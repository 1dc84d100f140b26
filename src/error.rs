use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level error taxonomy. The codes and their exit-code mapping are part
/// of the protocol contract and only change together with a protocol major bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Error,
    NotFound,
    ValidationFailed,
    InvalidInput,
    BridgeUnavailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::BridgeUnavailable => "BRIDGE_UNAVAILABLE",
        }
    }

    /// Process exit code reported by the CLI for this error kind.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Error => 1,
            Self::NotFound => 2,
            Self::ValidationFailed => 3,
            Self::InvalidInput => 4,
            Self::BridgeUnavailable => 5,
        }
    }

    /// Only an unreachable bridge is safe for a caller to retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::BridgeUnavailable)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error type for the bridge. Every per-call failure ends up as
/// one of these and is reported in an envelope, never as a crash.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("{message}")]
    Error { message: String },
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    ValidationFailed { message: String },
    #[error("{message}")]
    InvalidInput { message: String },
    #[error("{message}")]
    BridgeUnavailable { message: String },
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Error { .. } | AppError::Cancelled { .. } => ErrorCode::Error,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::ValidationFailed { .. } => ErrorCode::ValidationFailed,
            AppError::InvalidInput { .. } => ErrorCode::InvalidInput,
            AppError::BridgeUnavailable { .. } => ErrorCode::BridgeUnavailable,
        }
    }

    /// Rebuild an error from a wire code and message.
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::Error => AppError::Error { message },
            ErrorCode::NotFound => AppError::NotFound { message },
            ErrorCode::ValidationFailed => AppError::ValidationFailed { message },
            ErrorCode::InvalidInput => AppError::InvalidInput { message },
            ErrorCode::BridgeUnavailable => AppError::BridgeUnavailable { message },
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        AppError::Error {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AppError::ValidationFailed {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        AppError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        AppError::BridgeUnavailable {
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled { .. })
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Error {
            message: format!("I/O error: {e}"),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Error {
            message: format!("JSON error: {e}"),
        }
    }
}

impl From<crate::project::ProjectError> for AppError {
    fn from(e: crate::project::ProjectError) -> Self {
        match e {
            crate::project::ProjectError::Missing(path) => AppError::NotFound {
                message: format!("project file {} not found", path.display()),
            },
            other => AppError::Error {
                message: other.to_string(),
            },
        }
    }
}

/// Failure reported by a host adapter. Unreachability and domain failures
/// are separate variants so callers never have to guess which one they got.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error("host unavailable: {0}")]
    Unavailable(String),
    #[error("{message}")]
    Domain {
        code: Option<ErrorCode>,
        message: String,
    },
}

impl HostError {
    pub fn domain(message: impl Into<String>) -> Self {
        HostError::Domain {
            code: None,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HostError::Domain {
            code: Some(ErrorCode::NotFound),
            message: message.into(),
        }
    }
}

impl From<HostError> for AppError {
    fn from(e: HostError) -> Self {
        match e {
            HostError::Unavailable(message) => AppError::BridgeUnavailable { message },
            HostError::Domain { code, message } => {
                AppError::from_code(code.unwrap_or(ErrorCode::Error), message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(ErrorCode::Error.exit_code(), 1);
        assert_eq!(ErrorCode::NotFound.exit_code(), 2);
        assert_eq!(ErrorCode::ValidationFailed.exit_code(), 3);
        assert_eq!(ErrorCode::InvalidInput.exit_code(), 4);
        assert_eq!(ErrorCode::BridgeUnavailable.exit_code(), 5);
    }

    #[test]
    fn test_code_serializes_screaming_snake() {
        let json = serde_json::to_value(ErrorCode::BridgeUnavailable).unwrap_or_default();
        assert_eq!(json, serde_json::json!("BRIDGE_UNAVAILABLE"));
        let back: ErrorCode =
            serde_json::from_value(serde_json::json!("VALIDATION_FAILED")).unwrap_or(ErrorCode::Error);
        assert_eq!(back, ErrorCode::ValidationFailed);
    }

    #[test]
    fn test_host_error_mapping() {
        let unavailable: AppError = HostError::Unavailable("gone".into()).into();
        assert_eq!(unavailable.code(), ErrorCode::BridgeUnavailable);

        let domain: AppError = HostError::domain("bad mesh").into();
        assert_eq!(domain.code(), ErrorCode::Error);
        assert_eq!(domain.to_string(), "bad mesh");

        let missing: AppError = HostError::not_found("object 'Cube' not found").into();
        assert_eq!(missing.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(ErrorCode::BridgeUnavailable.is_retryable());
        assert!(!ErrorCode::Error.is_retryable());
        assert!(!ErrorCode::NotFound.is_retryable());
    }

    #[test]
    fn test_cancelled_maps_to_error() {
        let err = AppError::Cancelled {
            operation: "render.animation".into(),
        };
        assert_eq!(err.code(), ErrorCode::Error);
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "render.animation was cancelled");
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes exposed to clients. The wire form is
/// SCREAMING_SNAKE_CASE (`SSRF_BLOCKED`, `QUEUE_FULL`, ...); these names never
/// change once published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    ValidationError,
    AuthFailed,
    Unauthorized,
    ApprovalDenied,
    ApprovalExpired,
    AlreadyResolved,
    InvalidPath,
    SsrfBlocked,
    CommandBlocked,
    SizeLimit,
    ProtocolNotAllowed,
    QueueFull,
    ResourceExhausted,
    ConcurrencyLimit,
    Timeout,
    NotFound,
    ToolNotFound,
    SessionNotFound,
    AbortedByUser,
    AbortedByShutdown,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::ApprovalDenied => "APPROVAL_DENIED",
            ErrorCode::ApprovalExpired => "APPROVAL_EXPIRED",
            ErrorCode::AlreadyResolved => "ALREADY_RESOLVED",
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::SsrfBlocked => "SSRF_BLOCKED",
            ErrorCode::CommandBlocked => "COMMAND_BLOCKED",
            ErrorCode::SizeLimit => "SIZE_LIMIT",
            ErrorCode::ProtocolNotAllowed => "PROTOCOL_NOT_ALLOWED",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::ConcurrencyLimit => "CONCURRENCY_LIMIT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ToolNotFound => "TOOL_NOT_FOUND",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::AbortedByUser => "ABORTED_BY_USER",
            ErrorCode::AbortedByShutdown => "ABORTED_BY_SHUTDOWN",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Whether recovery inside a task may retry after this failure.
    /// Policy violations and schema failures are final; transient resource
    /// and network conditions are not.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::ResourceExhausted | ErrorCode::ConcurrencyLimit
        )
    }
}

/// A failure with a stable code, a user-safe message, and an optional
/// internal diagnostic that never leaves the process (logs only).
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{}: {message}", code.as_str())]
pub struct CodedError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal: Option<String>,
}

impl CodedError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            internal: None,
        }
    }

    pub fn with_internal(mut self, detail: impl Into<String>) -> Self {
        self.internal = Some(detail.into());
        self
    }

    /// Wrap an arbitrary error as UNKNOWN, keeping the original text as the
    /// internal diagnostic.
    pub fn internal_error(err: impl std::fmt::Display) -> Self {
        Self {
            code: ErrorCode::Unknown,
            message: "internal error".to_string(),
            internal: Some(err.to_string()),
        }
    }
}

/// Typed error hierarchy for moonbot.
///
/// Used at component boundaries (gateway dispatch, config loading, session
/// routing). Leaf functions keep `anyhow::Result`; the `Internal` variant
/// converts via `?`.
#[derive(Debug, Error)]
pub enum MoonbotError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("session error: {0}")]
    Session(String),

    #[error(transparent)]
    Coded(#[from] CodedError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type MoonbotResult<T> = std::result::Result<T, MoonbotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::SsrfBlocked).unwrap();
        assert_eq!(json, "\"SSRF_BLOCKED\"");
        let json = serde_json::to_string(&ErrorCode::QueueFull).unwrap();
        assert_eq!(json, "\"QUEUE_FULL\"");
        let back: ErrorCode = serde_json::from_str("\"ABORTED_BY_SHUTDOWN\"").unwrap();
        assert_eq!(back, ErrorCode::AbortedByShutdown);
    }

    #[test]
    fn as_str_matches_wire_form() {
        for code in [
            ErrorCode::ValidationError,
            ErrorCode::ApprovalDenied,
            ErrorCode::CommandBlocked,
            ErrorCode::ToolNotFound,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json.trim_matches('"'), code.as_str());
        }
    }

    #[test]
    fn coded_error_display() {
        let err = CodedError::new(ErrorCode::InvalidPath, "path escapes workspace");
        assert_eq!(err.to_string(), "INVALID_PATH: path escapes workspace");
    }

    #[test]
    fn internal_detail_not_serialized_when_absent() {
        let err = CodedError::new(ErrorCode::Timeout, "tool timed out");
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("internal").is_none());
    }

    #[test]
    fn retryable_classification() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::ResourceExhausted.is_retryable());
        assert!(!ErrorCode::SsrfBlocked.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
    }
}

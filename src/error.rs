use std::fmt;

use serde::Serialize;

use crate::models::resolve_trace_id;

/// Failure class of a directly-invoked engine operation. Serializes to the
/// stable `ERR_*` wire strings consumers dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    /// Caller handed us something unusable (bad serial, bad path, bad range).
    #[serde(rename = "ERR_VALIDATION")]
    Validation,
    /// An external binary or the device itself failed us.
    #[serde(rename = "ERR_DEPENDENCY")]
    Dependency,
    /// Local I/O or host-side failure.
    #[serde(rename = "ERR_SYSTEM")]
    System,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "ERR_VALIDATION",
            ErrorCode::Dependency => "ERR_DEPENDENCY",
            ErrorCode::System => "ERR_SYSTEM",
        }
    }
}

/// Typed, transport-friendly error for directly-invoked engine operations.
/// Capture loops never return these; loop failures degrade into events.
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: ErrorCode,
    pub trace_id: String,
}

impl AppError {
    /// Every constructed error carries a non-empty trace id; blank input is
    /// replaced with a fresh one.
    fn with_code(
        code: ErrorCode,
        message: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            error: message.into(),
            code,
            trace_id: resolve_trace_id(Some(trace_id.into())),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::Validation, message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::Dependency, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::System, message, trace_id)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code.as_str())
    }
}

impl std::error::Error for AppError {}

mod recorder;

pub use recorder::{record_error, ErrorState, MAX_MESSAGE_LEN, PLACEHOLDER_STATE};

use serde::Serialize;
use thiserror::Error;

/// Label placed in the `error` field of driver errors when the caller
/// does not supply one.
pub const DEFAULT_ERROR_LABEL: &str = "[odbc-bridge] SQL_ERROR";

/// Error category, mirroring how callers are expected to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A CLI call returned a non-success code.
    Driver,
    /// Malformed call arguments; nothing was scheduled.
    Usage,
    /// A job could not be allocated.
    Allocation,
    /// Invariant broken inside the crate (poisoned lock, worker panic).
    Internal,
}

/// User-facing driver error.
///
/// `errors` is reserved for multi-record reporting and is always empty:
/// only the most recent diagnostic record of a handle is captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlError {
    pub error: String,
    pub message: String,
    pub state: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub native_code: i32,
    pub errors: Vec<SqlError>,
}

fn is_zero(code: &i32) -> bool {
    *code == 0
}

impl SqlError {
    pub fn new(state: &ErrorState, label: &str) -> Self {
        Self {
            error: label.to_string(),
            message: state.message.clone(),
            state: state.sql_state.clone(),
            native_code: state.native_code,
            errors: Vec::new(),
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] {}", self.error, self.state, self.message)
    }
}

#[derive(Error, Debug, Clone)]
pub enum OdbcError {
    #[error("{0}")]
    Sql(SqlError),

    #[error("{0}")]
    Usage(String),

    #[error("Could not allocate enough memory in {origin}")]
    OutOfMemory { origin: &'static str },

    #[error("Invalid handle ID: {0}")]
    InvalidHandle(u32),

    #[error("{0} handle has already been released")]
    HandleReleased(&'static str),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl OdbcError {
    /// Converts a recorded diagnostic into a driver error (`ToUserError`).
    pub fn from_state(state: &ErrorState, label: &str) -> Self {
        OdbcError::Sql(SqlError::new(state, label))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OdbcError::Sql(_) => ErrorKind::Driver,
            OdbcError::Usage(_) | OdbcError::InvalidHandle(_) | OdbcError::HandleReleased(_) => {
                ErrorKind::Usage
            }
            OdbcError::OutOfMemory { .. } => ErrorKind::Allocation,
            OdbcError::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// SQLSTATE of a driver error, `None` for every other kind.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            OdbcError::Sql(e) => Some(&e.state),
            _ => None,
        }
    }

    /// Shape handed to host callers: driver errors keep their structure,
    /// everything else becomes `{ error, message }`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            OdbcError::Sql(e) => serde_json::to_value(e).unwrap_or(serde_json::Value::Null),
            other => {
                let label = match other.kind() {
                    ErrorKind::Usage => "TypeError",
                    ErrorKind::Allocation => "OutOfMemory",
                    _ => "InternalError",
                };
                serde_json::json!({ "error": label, "message": other.to_string() })
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, OdbcError>;

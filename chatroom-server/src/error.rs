//! Error types for the chat core and its storage collaborators.

use serde::Serialize;
use thiserror::Error;

/// Actionable description of a storage outage, surfaced on auth paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: &'static str,
    pub message: String,
    pub solution: String,
}

/// Errors surfaced to the requesting connection.
///
/// None of these are fatal to the process; they become a failed reply
/// (and sometimes a system notice) on the connection that caused them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Malformed input: length, color syntax, non-numeric argument.
    #[error("{0}")]
    Validation(String),

    /// A non-admin invoked an admin-only operation.
    #[error("{0}")]
    Permission(String),

    /// The request is well-formed but the current state does not allow it.
    #[error("{0}")]
    State(String),

    /// Durable storage could not be reached.
    #[error("{}", .0.message)]
    StorageUnavailable(Diagnostic),

    /// The connection's transport failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Diagnostic payload attached to the reply, if any.
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            Self::StorageUnavailable(d) => Some(d),
            _ => None,
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(d) => ChatError::StorageUnavailable(d),
            other => ChatError::StorageUnavailable(Diagnostic {
                kind: "STORAGE_ERROR",
                message: "Storage operation failed".to_string(),
                solution: format!("Check the database file and server logs ({other})"),
            }),
        }
    }
}

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {}", .0.message)]
    Unavailable(Diagnostic),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// The error used when no database is configured.
    pub fn not_configured() -> Self {
        StoreError::Unavailable(Diagnostic {
            kind: "NO_DATABASE",
            message: "Database is not connected".to_string(),
            solution: "Start the server with --db-path (or CHAT_DB_PATH) pointing at a writable SQLite file".to_string(),
        })
    }

    pub fn open_failed(path: &str, cause: &rusqlite::Error) -> Self {
        StoreError::Unavailable(Diagnostic {
            kind: "OPEN_FAILED",
            message: "Database could not be opened".to_string(),
            solution: format!("Check that {path} exists and is writable ({cause})"),
        })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_store_maps_to_diagnostic() {
        let err: ChatError = StoreError::not_configured().into();
        let diag = err.diagnostic().unwrap();
        assert_eq!(diag.kind, "NO_DATABASE");
        assert_eq!(err.to_string(), "Database is not connected");
    }

    #[test]
    fn validation_has_no_diagnostic() {
        let err = ChatError::validation("too long");
        assert!(err.diagnostic().is_none());
        assert_eq!(err.to_string(), "too long");
    }
}

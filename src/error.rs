//! Error types

use crate::protocol::ErrorFields;
use crate::transaction::TxState;
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Crate error type
#[derive(Debug, Error)]
pub enum Error {
    /// Connection parameters could not be resolved into a descriptor
    #[error("connection parameters: {0}")]
    Resolution(#[from] ResolutionError),

    /// I/O error on the underlying socket
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Wire protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Connection closed by the server
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection is in the middle of another exchange
    #[error("connection busy: {0}")]
    ConnectionBusy(String),

    /// Invalid connection state transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// The database could not be reached when the pool was created
    #[error("database unreachable: {0}")]
    Connectivity(#[source] Box<Error>),

    /// No connection became available before the context deadline
    #[error("timed out after {waited:?} waiting for a pooled connection")]
    AcquireTimeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// The caller's context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline passed during a database exchange
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The pool has been shut down
    #[error("pool is closed")]
    PoolClosed,

    /// The server rejected a statement
    #[error("{0}")]
    Db(DbError),

    /// The server aborted the transaction because of a concurrent writer (SQLSTATE 40001)
    #[error("serialization conflict: {0}")]
    SerializationConflict(DbError),

    /// Operation attempted on a transaction that already reached a terminal state
    #[error("transaction already {state}")]
    TransactionClosed {
        /// State the transaction is in
        state: TxState,
    },

    /// COMMIT was answered with ROLLBACK because the transaction had failed
    #[error("transaction aborted: the server rolled back instead of committing")]
    TransactionAborted,

    /// A column was missing or could not be converted to the requested type
    #[error("column error: {0}")]
    Column(String),
}

impl Error {
    /// Whether this error is a serialization conflict the caller may retry
    pub fn is_serialization_conflict(&self) -> bool {
        matches!(self, Error::SerializationConflict(_))
    }

    /// Whether re-running the whole transaction may succeed
    ///
    /// True for serialization conflicts and deadlock victims.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SerializationConflict(_) => true,
            Error::Db(e) => e.code == SqlState::DEADLOCK_DETECTED,
            _ => false,
        }
    }

    /// Server-side error details, if the server rejected the statement
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            Error::Db(e) | Error::SerializationConflict(e) => Some(e),
            _ => None,
        }
    }

    /// SQLSTATE of a server-side error
    pub fn code(&self) -> Option<&SqlState> {
        self.db_error().map(|e| &e.code)
    }
}

/// Classify a server ErrorResponse
///
/// This is the only place SQLSTATE codes are interpreted.
impl From<ErrorFields> for Error {
    fn from(fields: ErrorFields) -> Self {
        let err = DbError::from(fields);
        if err.code == SqlState::SERIALIZATION_FAILURE {
            Error::SerializationConflict(err)
        } else {
            Error::Db(err)
        }
    }
}

/// Errors produced while turning raw parameters into a connection descriptor
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// DNS lookup failed
    #[error("failed to resolve host '{host}': {source}")]
    Lookup {
        /// Host being resolved
        host: String,
        /// Underlying resolver error
        #[source]
        source: io::Error,
    },

    /// The host resolved, but not to any IPv4 address
    #[error("host '{host}' has no IPv4 address")]
    NoIpv4Address {
        /// Host being resolved
        host: String,
    },

    /// The port is not a number in 1..=65535
    #[error("invalid port '{value}'")]
    InvalidPort {
        /// Raw port value
        value: String,
    },

    /// The root certificate could not be loaded
    #[error("failed to load root certificate from {origin}: {reason}")]
    CertificateLoad {
        /// Where the certificate came from (path or "inline PEM")
        origin: String,
        /// What went wrong
        reason: String,
    },

    /// The host is not usable as a TLS server name
    #[error("invalid TLS server name '{host}'")]
    InvalidServerName {
        /// Offending host
        host: String,
    },
}

/// SQLSTATE error code
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlState(Cow<'static, str>);

impl SqlState {
    /// serialization_failure
    pub const SERIALIZATION_FAILURE: SqlState = SqlState(Cow::Borrowed("40001"));
    /// deadlock_detected
    pub const DEADLOCK_DETECTED: SqlState = SqlState(Cow::Borrowed("40P01"));
    /// unique_violation
    pub const UNIQUE_VIOLATION: SqlState = SqlState(Cow::Borrowed("23505"));
    /// undefined_table
    pub const UNDEFINED_TABLE: SqlState = SqlState(Cow::Borrowed("42P01"));
    /// in_failed_sql_transaction
    pub const IN_FAILED_SQL_TRANSACTION: SqlState = SqlState(Cow::Borrowed("25P02"));

    /// Create from a raw five-character code
    pub fn new(code: impl Into<String>) -> Self {
        SqlState(Cow::Owned(code.into()))
    }

    /// Raw code
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-side error details from an ErrorResponse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    /// Severity (ERROR, FATAL, ...)
    pub severity: String,
    /// SQLSTATE code
    pub code: SqlState,
    /// Primary message
    pub message: String,
    /// Optional detail
    pub detail: Option<String>,
    /// Optional hint
    pub hint: Option<String>,
    /// Cursor position in the statement text
    pub position: Option<String>,
}

impl From<ErrorFields> for DbError {
    fn from(fields: ErrorFields) -> Self {
        DbError {
            severity: fields.severity.unwrap_or_else(|| "ERROR".to_string()),
            code: SqlState::new(fields.code.unwrap_or_default()),
            message: fields.message.unwrap_or_default(),
            detail: fields.detail,
            hint: fields.hint,
            position: fields.position,
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for DbError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(code: &str, message: &str) -> ErrorFields {
        ErrorFields {
            severity: Some("ERROR".into()),
            code: Some(code.into()),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_serialization_failure_is_classified_as_conflict() {
        let err = Error::from(fields(
            "40001",
            "could not serialize access due to concurrent update",
        ));
        assert!(err.is_serialization_conflict());
        assert!(err.is_retryable());
        assert_eq!(err.code(), Some(&SqlState::SERIALIZATION_FAILURE));
    }

    #[test]
    fn test_unique_violation_is_not_a_conflict() {
        let err = Error::from(fields("23505", "duplicate key value"));
        assert!(!err.is_serialization_conflict());
        assert!(!err.is_retryable());
        assert!(matches!(err, Error::Db(_)));
        assert_eq!(err.code(), Some(&SqlState::UNIQUE_VIOLATION));
    }

    #[test]
    fn test_owned_and_const_sqlstate_compare_equal() {
        assert_eq!(SqlState::new("40001"), SqlState::SERIALIZATION_FAILURE);
        assert_ne!(SqlState::new("40P01"), SqlState::SERIALIZATION_FAILURE);
    }

    #[test]
    fn test_missing_code_is_not_a_conflict() {
        let err = Error::from(ErrorFields::default());
        assert!(!err.is_serialization_conflict());
        assert_eq!(err.code().map(SqlState::as_str), Some(""));
    }

    #[test]
    fn test_db_error_display() {
        let mut f = fields("42P01", "relation \"nope\" does not exist");
        f.detail = Some("while planning".into());
        let err = DbError::from(f);
        assert_eq!(
            err.to_string(),
            "ERROR: relation \"nope\" does not exist (42P01): while planning"
        );
    }

    #[test]
    fn test_non_db_errors_have_no_code() {
        assert!(Error::PoolClosed.code().is_none());
        assert!(Error::AcquireTimeout {
            waited: Duration::from_millis(5)
        }
        .db_error()
        .is_none());
    }

    #[test]
    fn test_resolution_error_converts() {
        let err: Error = ResolutionError::InvalidPort {
            value: "abc".into(),
        }
        .into();
        assert!(err.to_string().contains("invalid port 'abc'"));
    }
}

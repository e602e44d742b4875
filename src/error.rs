//! Error types for the sync engine
//!
//! Defines a unified error type that can represent errors from all components.
//! Every raw driver error is converted into this type at the component
//! boundary; the supervisor only ever sees the classification returned by
//! [`SyncError::kind`].

use std::fmt;
use std::io;
use std::time::Duration;

/// Classification of an error for retry policy and counters.
///
/// This is the taxonomy the scheduler acts on: transient and rate-limited
/// errors are retried with backoff, mapping errors are terminal for the row
/// that caused them, fatal errors abort startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retryable: network resets, 5xx, timeouts, deadlocks
    Transient,
    /// Retryable after the quota window: sheet 429
    RateLimited,
    /// Permanent for the offending record: bad field map, non-scalar key
    Mapping,
    /// Unique-key violation while applying a write
    Conflict,
    /// Referenced record does not exist on the target side
    NotFound,
    /// Unusable configuration or environment; abort startup
    Fatal,
}

impl ErrorKind {
    /// Label used in `sync_failure_total{kind=...}`
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Mapping => "mapping",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Unified error type for sync engine operations
#[derive(Debug)]
pub enum SyncError {
    /// I/O error (snapshot files, sockets)
    Io(io::Error),
    /// JSON (de)serialization error (queue payloads, config, sheet bodies)
    Json(String),
    /// Database driver error, with transience decided at conversion time
    Db { message: String, transient: bool },
    /// Sheet transport error (non-429 HTTP failures, decode failures)
    Sheet { message: String, transient: bool },
    /// Sheet quota exceeded; `retry_after` honors the Retry-After header
    RateLimited { retry_after: Option<Duration> },
    /// Field/record mapping failure; never retried
    Mapping(String),
    /// Unique-key violation on apply
    Conflict(String),
    /// Record missing on the target side for UPDATE/DELETE
    NotFound(String),
    /// Invalid configuration
    Config(String),
    /// Unrecoverable startup or environment failure
    Fatal(String),
    /// Generic internal error
    Internal(String),
}

impl SyncError {
    /// Create a mapping error for a key field missing from a sheet record
    pub fn missing_key_field(field: &str) -> Self {
        SyncError::Mapping(format!("key field '{}' missing from record", field))
    }

    /// Create a mapping error for a key field that is not a scalar
    pub fn non_scalar_key(field: &str) -> Self {
        SyncError::Mapping(format!("key field '{}' is not a scalar value", field))
    }

    /// Create a mapping error for a write naming an unmapped column
    pub fn unknown_column(column: &str) -> Self {
        SyncError::Mapping(format!("unknown column '{}' in write payload", column))
    }

    /// Create a config error for an unknown pair name
    pub fn unknown_pair(name: &str) -> Self {
        SyncError::Config(format!("no configured pair named '{}'", name))
    }

    /// Classify this error into the retry taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Io(_) => ErrorKind::Transient,
            SyncError::Json(_) => ErrorKind::Mapping,
            SyncError::Db { transient: true, .. } => ErrorKind::Transient,
            SyncError::Db { transient: false, .. } => ErrorKind::Fatal,
            SyncError::Sheet { transient: true, .. } => ErrorKind::Transient,
            SyncError::Sheet { transient: false, .. } => ErrorKind::Mapping,
            SyncError::RateLimited { .. } => ErrorKind::RateLimited,
            SyncError::Mapping(_) => ErrorKind::Mapping,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Config(_) => ErrorKind::Fatal,
            SyncError::Fatal(_) => ErrorKind::Fatal,
            SyncError::Internal(_) => ErrorKind::Transient,
        }
    }

    /// Whether the operation that produced this error may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::RateLimited)
    }

    /// Whether this error must abort the process
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Io(e) => write!(f, "{}", e),
            SyncError::Json(msg) => write!(f, "{}", msg),
            SyncError::Db { message, .. } => write!(f, "{}", message),
            SyncError::Sheet { message, .. } => write!(f, "{}", message),
            SyncError::RateLimited { retry_after: Some(d) } => {
                write!(f, "sheet rate limited, retry after {:?}", d)
            }
            SyncError::RateLimited { retry_after: None } => {
                write!(f, "sheet rate limited")
            }
            SyncError::Mapping(msg) => write!(f, "{}", msg),
            SyncError::Conflict(msg) => write!(f, "{}", msg),
            SyncError::NotFound(msg) => write!(f, "{}", msg),
            SyncError::Config(msg) => write!(f, "{}", msg),
            SyncError::Fatal(msg) => write!(f, "{}", msg),
            SyncError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> Self {
        SyncError::Io(e)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Json(e.to_string())
    }
}

impl From<mysql_async::Error> for SyncError {
    fn from(e: mysql_async::Error) -> Self {
        use mysql_async::Error as MyErr;
        match &e {
            // Server-reported errors carry a MySQL error code
            MyErr::Server(server) => match server.code {
                // ER_DUP_ENTRY, ER_DUP_KEY
                1062 | 1022 => SyncError::Conflict(server.message.clone()),
                // Lock wait timeout, deadlock
                1205 | 1213 => SyncError::Db {
                    message: server.message.clone(),
                    transient: true,
                },
                _ => SyncError::Db {
                    message: server.message.clone(),
                    transient: false,
                },
            },
            // Connectivity and protocol failures are retryable
            MyErr::Io(_) | MyErr::Driver(_) => SyncError::Db {
                message: e.to_string(),
                transient: true,
            },
            _ => SyncError::Db {
                message: e.to_string(),
                transient: false,
            },
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        // Connection/timeout failures retry; body decode failures do not
        let transient = e.is_timeout() || e.is_connect() || e.is_request();
        SyncError::Sheet {
            message: e.to_string(),
            transient,
        }
    }
}

/// Result type alias for sync engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

//! Error types for the connectivity layer.
//!
//! Every store-level failure surfaces to the caller as a [`DbError`] carrying enough
//! structure (the store's error code in particular) to be classified by
//! [`crate::classify::ErrorClassifier`].

use crate::classify::{Dialect, ErrorKind};
use crate::tls::TlsConfigError;

use std::fmt;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type DbResult<T> = Result<T, DbError>;

/// Store-reported error code.
///
/// The symbolic dialect (PostgreSQL) reports five-character SQLSTATE codes, the numeric
/// dialect (MySQL) reports server error numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// SQLSTATE code, e.g. `23505`.
    Sqlstate(String),
    /// Numeric server error, e.g. `1062`.
    Numeric(u16),
}

impl ErrorCode {
    /// Create a SQLSTATE code.
    pub fn sqlstate(code: impl Into<String>) -> Self {
        Self::Sqlstate(code.into())
    }

    /// The dialect whose representation this code uses.
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Sqlstate(_) => Dialect::Postgres,
            Self::Numeric(_) => Dialect::MySql,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlstate(code) => f.write_str(code),
            Self::Numeric(number) => write!(f, "{number}"),
        }
    }
}

/// Main error type for the connectivity layer.
#[derive(Debug, Error)]
pub enum DbError {
    /// Dial or liveness-probe failure, or an operation attempted while disconnected.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Missing, unreadable or unparseable certificate material.
    #[error(transparent)]
    Tls(#[from] TlsConfigError),

    /// Query execution error with store-specific details.
    #[error("{message}")]
    Query {
        /// Store error message.
        message: String,
        /// Additional detail from the store.
        detail: Option<String>,
        /// Store hint.
        hint: Option<String>,
        /// Position in query (1-indexed).
        position: Option<usize>,
        /// Store error code.
        code: Option<ErrorCode>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No pooled connection became available within the wait timeout.
    #[error("Pool timeout: {message}")]
    PoolTimeout {
        /// Human-readable error message.
        message: String,
        /// Number of tasks waiting for connections.
        waiting: usize,
    },

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation exceeded its caller-supplied deadline.
    #[error("Operation timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds allowed before giving up.
        elapsed_ms: u64,
    },

    /// A maintenance command is already running against this store.
    #[error("Maintenance already in progress")]
    MaintenanceInProgress,

    /// Invalid settings.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },
}

impl DbError {
    // ========== Constructors ==========

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a query error with the given details.
    pub fn query(
        message: impl Into<String>,
        detail: Option<String>,
        hint: Option<String>,
        position: Option<usize>,
        code: Option<ErrorCode>,
    ) -> Self {
        Self::Query { message: message.into(), detail, hint, position, code, source: None }
    }

    /// Create a query error carrying only a message and a store code.
    ///
    /// Useful for bridging errors from drivers other than `tokio-postgres`.
    pub fn with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        Self::query(message, None, None, None, Some(code))
    }

    /// Create a pool timeout error.
    pub fn pool_timeout(message: impl Into<String>, waiting: usize) -> Self {
        Self::PoolTimeout { message: message.into(), waiting }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    // ========== Methods ==========

    /// Store error code, if the store reported one.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            Self::Query { code, .. } => code.as_ref(),
            _ => None,
        }
    }

    /// Position in query (if applicable).
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::Query { position, .. } => *position,
            _ => None,
        }
    }

    /// Semantic kind of this error, using the dialect implied by its code.
    pub fn kind(&self) -> ErrorKind {
        match self.code() {
            Some(code) => code.dialect().kind_of(code),
            None => ErrorKind::Unclassified,
        }
    }

    /// True if the store rejected a row because of a unique constraint.
    pub fn is_duplicate_key(&self) -> bool {
        self.kind() == ErrorKind::DuplicateKey
    }

    /// True if the store rejected a change because of a referential constraint.
    pub fn is_foreign_key_violation(&self) -> bool {
        self.kind() == ErrorKind::ForeignKeyViolation
    }

    /// Check if this error represents a cancelled operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error represents a missing or lost connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Fatal errors must stop startup rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::PoolTimeout { .. } | Self::Timeout { .. } | Self::MaintenanceInProgress
        )
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::Tls(_) => "TLS",
            Self::Query { .. } => "Query",
            Self::PoolTimeout { .. } => "Pool",
            Self::Cancelled => "Cancelled",
            Self::Timeout { .. } => "Timeout",
            Self::MaintenanceInProgress => "Maintenance",
            Self::Config { .. } => "Config",
        }
    }

    /// Get actionable hint for the operator.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connection { .. } => Some("Check that the database server is reachable"),
            Self::Tls(_) => Some("Verify the CA, client certificate and client key paths"),
            Self::Query { hint, .. } => hint.as_deref(),
            Self::PoolTimeout { .. } => Some("Raise the pool size or shorten transactions"),
            Self::Cancelled => None,
            Self::Timeout { .. } => None,
            Self::MaintenanceInProgress => Some("Wait for the running maintenance to finish"),
            Self::Config { .. } => None,
        }
    }
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to DbError.
impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();

            // Connection exceptions (08xxx) and authorization failures (28xxx)
            if code_str.starts_with("08") || code_str.starts_with("28") {
                return DbError::Connection { message, source: Some(Box::new(err)) };
            }

            let detail = db_err.detail().map(String::from);
            let hint = db_err.hint().map(String::from);
            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos as usize),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });
            let code = Some(ErrorCode::sqlstate(code_str));
            return DbError::Query { message, detail, hint, position, code, source: Some(Box::new(err)) };
        }

        if err.is_closed() {
            return DbError::Connection {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        DbError::Query {
            message: err.to_string(),
            detail: None,
            hint: None,
            position: None,
            code: None,
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from deadpool_postgres::PoolError to DbError.
impl From<deadpool_postgres::PoolError> for DbError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => match DbError::from(e) {
                DbError::Query { message, source, .. } => DbError::Connection { message, source },
                other => other,
            },
            deadpool_postgres::PoolError::Closed => DbError::connection("Connection pool is closed"),
            other => DbError::connection(format!("Failed to acquire connection: {other}")),
        }
    }
}

//! Error types for db-helper.
//!
//! Driver failures are classified once, at the connection scope, into
//! [`DbError::Timeout`] or [`DbError::Driver`]. Every executor operation then
//! wraps whatever went wrong in [`DbError::Operation`], so callers always see a
//! single envelope and can still match on the underlying kind via
//! [`DbError::root`].

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("{operation} experienced a SQL timeout")]
    Timeout {
        /// Qualified operation name, e.g. `db_helper::db::executor::QueryExecutor::execute_command`
        operation: String,
        /// Configured limit that elapsed, when the timeout was ours rather than the driver's.
        elapsed: Option<Duration>,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("{operation} experienced a SQL exception: {source}")]
    Driver {
        operation: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        #[source]
        source: sqlx::Error,
    },

    #[error("Conversion failed for {type_name}: {message}")]
    Conversion {
        type_name: String,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Failed to map row into {type_name}: {source}")]
    Mapping {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("{type_name}::{operation} experienced an exception with parameters {parameters}: {source}")]
    Operation {
        type_name: String,
        operation: String,
        parameters: String,
        #[source]
        source: Box<DbError>,
    },
}

impl DbError {
    /// Create a timeout error raised by one of our own deadlines.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed: Some(elapsed),
            source: None,
        }
    }

    /// Create a conversion error without an underlying serde error.
    pub fn conversion(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conversion {
            type_name: type_name.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap a failure in the uniform operation envelope.
    pub fn operation(
        type_name: impl Into<String>,
        operation: impl Into<String>,
        parameters: impl Into<String>,
        source: DbError,
    ) -> Self {
        Self::Operation {
            type_name: type_name.into(),
            operation: operation.into(),
            parameters: parameters.into(),
            source: Box::new(source),
        }
    }

    /// Classify a driver failure raised while running `operation`.
    ///
    /// Pool/IO timeouts and server-side statement cancellation become
    /// [`DbError::Timeout`], undecodable column values a
    /// [`DbError::Conversion`]; everything else is a [`DbError::Driver`].
    pub fn from_driver(operation: impl Into<String>, err: sqlx::Error) -> Self {
        let operation = operation.into();
        if let sqlx::Error::ColumnDecode { index, source } = &err {
            return Self::conversion(
                format!("column {index}"),
                format!("{operation} could not decode the value: {source}"),
            );
        }
        if is_driver_timeout(&err) {
            return Self::Timeout {
                operation,
                elapsed: None,
                source: Some(err),
            };
        }
        let sql_state = match &err {
            sqlx::Error::Database(db_err) => db_err.code().map(|c| c.to_string()),
            _ => None,
        };
        Self::Driver {
            operation,
            sql_state,
            source: err,
        }
    }

    /// The innermost error, with any operation envelopes peeled off.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Name of the operation that failed, when this is an operation envelope.
    pub fn operation_name(&self) -> Option<&str> {
        match self {
            Self::Operation { operation, .. } => Some(operation),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout { .. })
    }

    pub fn is_driver(&self) -> bool {
        matches!(self.root(), Self::Driver { .. })
    }

    /// SQLSTATE reported by the database, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self.root() {
            Self::Driver { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is worth retrying by the caller.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Timeout { .. } => true,
            Self::Driver { source, .. } => matches!(
                source,
                sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// PostgreSQL `query_canceled` (statement_timeout) and MySQL
/// `ER_QUERY_TIMEOUT` both mean the server gave up on the statement.
const TIMEOUT_CODES: &[&str] = &["57014", "3024"];

fn is_driver_timeout(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Io(io_err) => io_err.kind() == std::io::ErrorKind::TimedOut,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| TIMEOUT_CODES.iter().any(|c| code == *c)),
        _ => false,
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

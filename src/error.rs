//! Error types for the audit data-access core.
//!
//! All failures bubble to the immediate caller as one of four kinds:
//! configuration lookups, transaction lifecycle, generic database/query
//! failures, and schema introspection. The HTTP/GraphQL layer above this
//! crate is responsible for translating these into user-visible responses.

use thiserror::Error;

/// Boxed error for attaching underlying driver causes.
pub type BoxDynError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DbError {
    /// A requested connection name is not configured, or the configuration
    /// itself is unusable (bad URL parts, invalid pool options).
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Transaction lifecycle failure: commit/rollback with no active
    /// transaction, a driver failure while issuing transaction statements,
    /// or a unit of work that failed and was rolled back.
    ///
    /// `source` carries the original cause. `rollback` is set when the
    /// compensating rollback itself also failed, so callers can tell
    /// "work failed, rollback succeeded" apart from "work failed, rollback
    /// also failed".
    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<BoxDynError>,
        rollback: Option<BoxDynError>,
    },

    /// Generic driver or query failure. `attempts` is set when a bounded
    /// retry loop exhausted its budget.
    #[error("Database error: {message}")]
    Database {
        message: String,
        attempts: Option<u32>,
        #[source]
        source: Option<BoxDynError>,
    },

    /// Schema introspection failure (table/column/index lookup).
    #[error("Schema error: {message} (object: {object})")]
    Schema {
        message: String,
        object: String,
        #[source]
        source: Option<BoxDynError>,
    },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a transaction error with no underlying cause (e.g. misuse
    /// such as committing with no active transaction).
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
            rollback: None,
        }
    }

    /// Create a transaction error wrapping an underlying cause.
    pub fn transaction_with(message: impl Into<String>, source: impl Into<BoxDynError>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: Some(source.into()),
            rollback: None,
        }
    }

    /// A unit of work failed and was rolled back successfully.
    pub fn rolled_back(cause: impl Into<BoxDynError>) -> Self {
        Self::Transaction {
            message: "unit of work failed, transaction rolled back".to_string(),
            source: Some(cause.into()),
            rollback: None,
        }
    }

    /// A unit of work failed and the compensating rollback failed as well.
    pub fn rollback_failed(
        cause: impl Into<BoxDynError>,
        rollback: impl Into<BoxDynError>,
    ) -> Self {
        Self::Transaction {
            message: "unit of work failed and rollback also failed".to_string(),
            source: Some(cause.into()),
            rollback: Some(rollback.into()),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            attempts: None,
            source: None,
        }
    }

    /// A retried query gave up after `attempts` attempts.
    pub fn retries_exhausted(attempts: u32, source: impl Into<BoxDynError>) -> Self {
        Self::Database {
            message: format!("query failed after {attempts} attempts"),
            attempts: Some(attempts),
            source: Some(source.into()),
        }
    }

    /// Create a schema error wrapping an introspection failure.
    pub fn schema(
        message: impl Into<String>,
        object: impl Into<String>,
        source: impl Into<BoxDynError>,
    ) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
            source: Some(source.into()),
        }
    }

    /// The secondary rollback failure, when a unit of work failed and the
    /// compensating rollback failed too.
    pub fn rollback_failure(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
        match self {
            Self::Transaction {
                rollback: Some(err),
                ..
            } => Some(err.as_ref()),
            _ => None,
        }
    }

    /// The number of attempts made before giving up, for retry exhaustion.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Database { attempts, .. } => *attempts,
            _ => None,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            err => DbError::Database {
                message: err.to_string(),
                attempts: None,
                source: Some(Box::new(err)),
            },
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

//! Database error types.

use std::time::Duration;

use thiserror::Error;

/// SQLite primary result codes that signal lock contention.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// The store did not answer within the configured bound.
    #[error("store operation exceeded {0:?}")]
    Timeout(Duration),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        Self::Query(err)
    }
}

impl DbError {
    fn sqlx(&self) -> Option<&sqlx::Error> {
        match self {
            Self::Connect(e) | Self::Query(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        self.sqlx()
            .and_then(sqlx::Error::as_database_error)
            .is_some_and(|e| e.is_unique_violation())
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlx()
            .and_then(sqlx::Error::as_database_error)
            .is_some_and(|e| e.is_foreign_key_violation())
    }

    /// Failures that say nothing about the request itself: timeouts, pool
    /// exhaustion, I/O and lock contention.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connect(_) => true,
            Self::Serialization(_) => false,
            Self::Query(err) => is_transient(err),
        }
    }
}

pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i64>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DbError::Timeout(Duration::from_millis(10)).is_transient());
        assert!(DbError::Query(sqlx::Error::PoolTimedOut).is_transient());
        assert!(DbError::Query(sqlx::Error::PoolClosed).is_transient());
        assert!(!DbError::Query(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_non_database_errors_are_not_violations() {
        let err = DbError::Query(sqlx::Error::RowNotFound);
        assert!(!err.is_unique_violation());
        assert!(!err.is_foreign_key_violation());
    }
}

//! Error types for the driver adapter.

use thiserror::Error;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced by the driver adapter.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Underlying SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection has been closed.
    #[error("database is closed")]
    Closed,

    /// A statement produced an unexpected result shape.
    #[error("unexpected statement result: {message}")]
    UnexpectedResult {
        /// Description of the mismatch.
        message: String,
    },
}

impl DriverError {
    /// Creates an unexpected-result error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedResult {
            message: message.into(),
        }
    }

    /// Returns true if this error is SQLite reporting BUSY or LOCKED.
    ///
    /// The entity layer consults its retry policy on these; every other
    /// error propagates immediately.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        match self {
            DriverError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_not_busy() {
        assert!(!DriverError::Closed.is_busy());
    }

    #[test]
    fn busy_failure_is_busy() {
        let inner = rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY);
        let err = DriverError::Sqlite(rusqlite::Error::SqliteFailure(inner, None));
        assert!(err.is_busy());
    }
}

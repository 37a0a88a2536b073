//! Error types for the entity manager.

use thiserror::Error;

/// Result type for entity-manager operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in entity-manager operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Driver-level failure.
    #[error("driver error: {0}")]
    Driver(#[from] sqlent_driver::DriverError),

    /// Invalid schema declaration.
    #[error("schema error: {message}")]
    Schema {
        /// Description of the problem.
        message: String,
    },

    /// A chain of required foreign keys loops back onto itself.
    #[error("circular dependency involving entity '{entity}'")]
    CircularDependency {
        /// The entity whose registration or flush detected the cycle.
        entity: String,
    },

    /// A value could not be coerced to its field's kind.
    #[error("value error: {message}")]
    Value {
        /// Description of the rejected value.
        message: String,
    },

    /// A required field is missing or null.
    #[error("required field '{field}' of '{entity}' is missing")]
    RequiredField {
        /// Owning entity name.
        entity: String,
        /// Field name.
        field: String,
    },

    /// A unique field would collide with an existing row.
    #[error("unique field '{field}' of '{entity}' already holds '{value}'")]
    UniqueViolation {
        /// Owning entity name.
        entity: String,
        /// Field name.
        field: String,
        /// The offending lookup value, rendered.
        value: String,
    },

    /// The named field does not exist on the entity.
    #[error("no field '{field}' on entity '{entity}'")]
    UnknownField {
        /// Entity name.
        entity: String,
        /// The unrecognized field name.
        field: String,
    },

    /// The named entity is not registered.
    #[error("entity not found: {name}")]
    EntityNotFound {
        /// The unrecognized entity name.
        name: String,
    },

    /// The database has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// `begin(strict)` while a transaction is already active.
    #[error("a transaction is already active")]
    TransactionActive,

    /// Commit or rollback without an active transaction.
    #[error("no active transaction")]
    NoTransaction,

    /// Query execution attempted inside a transaction.
    #[error("queries cannot run inside a transaction")]
    QueryInTransaction,

    /// The flush engine stalled with dirty rows remaining.
    #[error("unresolvable circular dependency: {remaining} rows still dirty")]
    UnresolvedFlush {
        /// Rows left dirty when progress stopped.
        remaining: usize,
    },

    /// JSON encoding or decoding failed, or the codec is absent.
    #[error("json error: {message}")]
    Json {
        /// Description of the failure.
        message: String,
    },

    /// A query expression failed to compile.
    #[error("query compile error: {message}")]
    QueryCompile {
        /// Description of the failure.
        message: String,
    },
}

impl DbError {
    /// Creates a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Creates a value error.
    pub fn value(message: impl Into<String>) -> Self {
        Self::Value {
            message: message.into(),
        }
    }

    /// Creates a required-field error.
    pub fn required(entity: impl Into<String>, field: impl Into<String>) -> Self {
        Self::RequiredField {
            entity: entity.into(),
            field: field.into(),
        }
    }

    /// Creates a unique-violation error.
    pub fn unique(
        entity: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::UniqueViolation {
            entity: entity.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    /// Creates an unknown-field error.
    pub fn unknown_field(entity: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            entity: entity.into(),
            field: field.into(),
        }
    }

    /// Creates a JSON error.
    pub fn json(message: impl Into<String>) -> Self {
        Self::Json {
            message: message.into(),
        }
    }

    /// Creates a query-compile error.
    pub fn query_compile(message: impl Into<String>) -> Self {
        Self::QueryCompile {
            message: message.into(),
        }
    }

    /// Returns true if the underlying cause is the engine reporting BUSY.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, DbError::Driver(e) if e.is_busy())
    }
}

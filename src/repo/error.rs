//! Error types for repository persistence.

use std::fmt;

use thiserror::Error;

/// Structured classification for store/database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/foreign-key/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl StoreDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StoreDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> StoreDbErrorKind {
    let code = database_error.code();
    if matches!(
        code.as_deref(),
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
    ) {
        return StoreDbErrorKind::BusyOrLocked;
    }

    if database_error.is_unique_violation()
        || database_error.is_foreign_key_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT"))
    {
        return StoreDbErrorKind::ConstraintViolation;
    }

    if database_error
        .message()
        .to_ascii_lowercase()
        .contains("database is locked")
    {
        return StoreDbErrorKind::BusyOrLocked;
    }

    StoreDbErrorKind::Other
}

/// Errors that can occur while reading or writing repositories.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        kind: StoreDbErrorKind,
        message: String,
    },

    #[error("repository not found: id {0}")]
    RepositoryNotFound(i64),

    /// A stored JSON column could not be encoded or decoded.
    #[error("invalid {column} column: {reason}")]
    InvalidColumn { column: &'static str, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StoreDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    pub(crate) fn invalid_column(column: &'static str, err: &serde_json::Error) -> Self {
        Self::InvalidColumn {
            column,
            reason: err.to_string(),
        }
    }

    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<StoreDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::RepositoryNotFound(_) | Self::InvalidColumn { .. } => None,
        }
    }
}

//! Errors shared across the storage backends

use thiserror::Error;

/// Backend-level storage fault
///
/// `Conflict` marks a serialization failure (e.g. SQLSTATE 40001 under
/// SERIALIZABLE isolation) that callers may retry through
/// [`crate::backoff::retry_with_backoff`]; every other variant is permanent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("serialization conflict, retry the transaction")]
    Conflict,

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Conflict)
    }
}

#[cfg(feature = "postgres")]
mod sqlx_support {
    use super::StorageError;

    /// Postgres signals a SERIALIZABLE conflict with SQLSTATE 40001 and a
    /// deadlock with 40P01; both are safe to retry from scratch.
    const SERIALIZATION_FAILURE: &str = "40001";
    const DEADLOCK_DETECTED: &str = "40P01";

    impl From<sqlx::Error> for StorageError {
        fn from(err: sqlx::Error) -> Self {
            if let Some(db) = err.as_database_error() {
                if let Some(code) = db.code() {
                    if code == SERIALIZATION_FAILURE || code == DEADLOCK_DETECTED {
                        return StorageError::Conflict;
                    }
                    if code.starts_with("23") {
                        return StorageError::Constraint(db.to_string());
                    }
                }
            }
            StorageError::Backend(err.to_string())
        }
    }
}

// ⚠️ Error types for the persistence layer
//
// Store failures are classified once, here, so the session and the service
// can hand callers a typed error instead of a raw SQLite code.

use rusqlite::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PersistenceError>;

#[derive(Error, Debug)]
pub enum PersistenceError {
    /// A row that had to exist is gone (refresh of a deleted account)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation invoked outside its required scope (no transaction, double
    /// begin, detached or foreign instance)
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Store rejected an insert or update
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database busy/locked, or a row changed underneath the session
    #[error("Concurrency conflict: {0}")]
    Concurrency(String),

    #[error("Non-unique result: {0}")]
    NonUniqueResult(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message) => {
                let detail = message.clone().unwrap_or_else(|| failure.to_string());
                match failure.code {
                    ErrorCode::ConstraintViolation => PersistenceError::ConstraintViolation(detail),
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                        PersistenceError::Concurrency(detail)
                    }
                    _ => PersistenceError::Storage(err),
                }
            }
            _ => PersistenceError::Storage(err),
        }
    }
}

impl PersistenceError {
    /// Short machine-readable kind, used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            PersistenceError::NotFound(_) => "not_found",
            PersistenceError::IllegalState(_) => "illegal_state",
            PersistenceError::ConstraintViolation(_) => "constraint_violation",
            PersistenceError::Concurrency(_) => "concurrency",
            PersistenceError::NonUniqueResult(_) => "non_unique_result",
            PersistenceError::Config(_) => "config",
            PersistenceError::Storage(_) => "storage",
            PersistenceError::Io(_) => "io",
            PersistenceError::Json(_) => "json",
            PersistenceError::Csv(_) => "csv",
        }
    }
}

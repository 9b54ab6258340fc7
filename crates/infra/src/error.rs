//! Storage errors shared by the metadata and run stores.

use batchflow_core::{DomainError, Parameter};
use thiserror::Error;

/// Store operation error.
///
/// These are infrastructure errors (missing keys, lost compare-and-set races,
/// backend failures), not workflow decisions.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Unknown token, or one that can no longer be resolved (abandoned / purged).
    #[error("suspension token not found or no longer resolvable")]
    TokenNotFound,

    #[error("not found: {0}")]
    NotFound(String),

    /// Compare-and-set lost (stale version, pending job already present).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("a run is already active for parameter '{0}'")]
    RunAlreadyActive(Parameter),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub(crate) fn poisoned() -> Self {
        Self::Storage("lock poisoned".to_string())
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Conflict(msg) => StoreError::Conflict(msg),
            other => StoreError::Storage(other.to_string()),
        }
    }
}

/// Map SQLx errors to `StoreError`.
///
/// | SQLx error | Code | StoreError |
/// |---|---|---|
/// | Database (unique violation) | `23505` | `Conflict` |
/// | Database (other) | any | `Storage` |
/// | PoolClosed / other | n/a | `Storage` |
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

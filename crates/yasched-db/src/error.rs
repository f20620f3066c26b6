//! Error types for the task & node repository.

use thiserror::Error;

/// Result type alias for repository operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to build connection pool: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("query error: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("task metadata (de)serialization error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("row {0} has invalid status code {1}")]
    InvalidStatus(i32, i16),
}

impl DbError {
    /// Transient errors are worth retrying with backoff; everything else
    /// (schema violations, malformed rows) is permanent and fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Pool(_) => true,
            // A query error without a server-side cause is a broken or
            // closed connection; one with a cause is a real SQL problem.
            DbError::Query(e) => e.is_closed() || e.as_db_error().is_none(),
            DbError::CreatePool(_) | DbError::Metadata(_) | DbError::InvalidStatus(..) => false,
        }
    }
}

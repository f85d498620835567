//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for forgeline_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => forgeline_core::Error::NotFound(msg),
            DbError::Conflict(msg) => forgeline_core::Error::Conflict(msg),
            other => forgeline_core::Error::Queue(other.to_string()),
        }
    }
}

//! Error types for Forgeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("workspace error: {0}")]
    Workspace(String),
}

pub type Result<T> = std::result::Result<T, Error>;

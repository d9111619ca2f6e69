//! Error taxonomy (spec §7): a single enum the HTTP boundary maps onto status
//! codes, and every component's `Result` alias resolves to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl From<sqlx::Error> for RagError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => RagError::NotFound("row not found".to_string()),
            other => RagError::Internal(anyhow::anyhow!(other)),
        }
    }
}

impl From<reqwest::Error> for RagError {
    fn from(e: reqwest::Error) -> Self {
        RagError::Unavailable(e.to_string())
    }
}

impl From<redis::RedisError> for RagError {
    fn from(e: redis::RedisError) -> Self {
        RagError::Unavailable(e.to_string())
    }
}

//! Error types for server startup and infrastructure

use thiserror::Error;

use crate::conversation::ProtocolError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("S3 error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol setup error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("S3 SDK error: {0}")]
    SdkError(String),
}

impl From<StorageError> for ProtocolError {
    fn from(e: StorageError) -> Self {
        ProtocolError::Storage(e.to_string())
    }
}

use crawler_core::CrawlerError;
use thiserror::Error;

/// Errors raised by the registry and job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("data source not found: {id}")]
    SourceNotFound { id: String },

    #[error("crawl job not found: {id}")]
    JobNotFound { id: String },

    /// Single-flight violation: the source already has a queued or running job.
    #[error("data source {source_id} already has a queued or running job")]
    AlreadyRunning { source_id: String },

    /// The record is in a state that forbids the operation.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// Input rejected by validation, or a stored value that no longer parses.
    #[error(transparent)]
    Invalid(#[from] CrawlerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::SourceNotFound { .. } | StoreError::JobNotFound { .. } => "NOT_FOUND",
            StoreError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            StoreError::Conflict { .. } => "CONFLICT",
            StoreError::Invalid(e) => e.code(),
            StoreError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

use crawler_core::CrawlerError;
use crawler_store::StoreError;
use thiserror::Error;

/// Errors returned by orchestrator operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The admission queue is at capacity; no job record was created.
    #[error("job queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("data source {source_id} already has a queued or running job")]
    AlreadyRunning { source_id: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error(transparent)]
    Validation(CrawlerError),

    #[error(transparent)]
    Store(StoreError),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::QueueFull { .. } => "QUEUE_FULL",
            EngineError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::Conflict { .. } => "CONFLICT",
            EngineError::Validation(e) => e.code(),
            EngineError::Store(e) => e.code(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SourceNotFound { id } => EngineError::NotFound {
                what: "data source",
                id,
            },
            StoreError::JobNotFound { id } => EngineError::NotFound {
                what: "crawl job",
                id,
            },
            StoreError::AlreadyRunning { source_id } => EngineError::AlreadyRunning { source_id },
            StoreError::Conflict { reason } => EngineError::Conflict { reason },
            StoreError::Invalid(e) => EngineError::Validation(e),
            other => EngineError::Store(other),
        }
    }
}

impl From<CrawlerError> for EngineError {
    fn from(err: CrawlerError) -> Self {
        EngineError::Validation(err)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrawlerError {
    /// Short, stable error code for API layers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CrawlerError::Config(_) => "CONFIG_ERROR",
            CrawlerError::Validation(_) => "VALIDATION_ERROR",
            CrawlerError::InvalidSchedule { .. } => "VALIDATION_ERROR",
            CrawlerError::UnknownVariant { .. } => "VALIDATION_ERROR",
            CrawlerError::Serialization(_) => "SERIALIZATION_ERROR",
            CrawlerError::Io(_) => "IO_ERROR",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CrawlerError::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CrawlerError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether retrying the same call can reasonably succeed.
    /// External-service failures (RPC outage, webhook endpoint down)
    /// are retryable; everything else is a caller mistake or a hard fault.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ExternalService(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

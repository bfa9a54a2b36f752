use thiserror::Error;

/// Why a job handler did not complete.
///
/// Every variant is retryable from the runner's point of view; the message
/// ends up in the dead-letter record once attempts run out.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler ran and reported failure.
    #[error("{0}")]
    Failed(String),

    /// The stored payload did not deserialize into the handler's input type.
    #[error("Payload decode failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// The handler panicked; the panic message is captured when it is a string.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Nothing is registered for the job's slug.
    #[error("No handler registered for job: {name}")]
    NoHandler { name: String },
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, HandlerError>;

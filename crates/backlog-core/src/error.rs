use thiserror::Error;

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A schedule string the clock could not turn into an instant.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

pub type Result<T> = std::result::Result<T, BacklogError>;

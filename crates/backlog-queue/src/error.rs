use backlog_core::BacklogError;
use thiserror::Error;

/// Errors that can occur within the queue engine.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Reading or writing a job file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload or stored record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Schedule parsing or configuration, raised by `backlog-core`.
    #[error(transparent)]
    Core(#[from] BacklogError),

    /// The configured backend name has no driver behind it.
    #[error("Unknown queue driver: {name} (expected \"file\" or \"database\")")]
    UnknownDriver { name: String },

    /// A configured table name is not a plain SQL identifier.
    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    /// No record with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, QueueError>;

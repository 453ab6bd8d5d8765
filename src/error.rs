//! Error types for the log engine.

use crate::models::ProcessStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing input, rejected before the store is touched.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A terminal status update against a process that already finished.
    #[error("process {id} is already {status}")]
    InvalidTransition { id: String, status: ProcessStatus },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The full-text index could not serve or record a request.
    #[error("search index unavailable: {0}")]
    IndexDegraded(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}

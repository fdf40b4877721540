use thiserror::Error;

/// Error taxonomy for consumer-facing operations.
///
/// Producer-facing dispatch never returns these: malformed events are dropped
/// with a diagnostic and delivery to a missing sink is a silent no-op.
#[derive(Error, Debug)]
pub enum Error {
    #[error("observer not found: {0}")]
    NotFound(String),

    #[error("observer name already registered with a different config: {0}")]
    AlreadyRegistered(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no events available to take")]
    NoData,

    #[error("ingestion is disabled")]
    IngestionDisabled,

    #[error("storage failure during {operation}: {cause}")]
    Storage { operation: String, cause: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn storage(operation: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

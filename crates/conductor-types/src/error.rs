use thiserror::Error;

/// Errors from repository operations (used by trait definitions in conductor-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised when a step's output cannot be merged into the execution context.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("output delta is {size} bytes, limit is {max}")]
    DeltaTooLarge { size: usize, max: usize },

    #[error("context would grow to {size} bytes, limit is {max}")]
    ContextTooLarge { size: usize, max: usize },

    #[error("context is not a JSON object")]
    NotAnObject,

    #[error("serialization error: {0}")]
    Serialization(String),
}

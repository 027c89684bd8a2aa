//! Error types for the indexing core.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`IrisError`]. The variants follow the failure taxonomy of the indexer:
//! capacity errors reject a single write, range and state errors flag caller
//! mistakes at public boundaries, and `Aborted` reports a buffer that was
//! discarded after a failure.

use std::io;

/// The error type for indexing operations.
#[derive(Debug, thiserror::Error)]
pub enum IrisError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// A document, value or pool exceeded a hard size limit.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IrisError {
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        IrisError::InvalidArgument(msg.into())
    }

    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        IrisError::InvalidOperation(msg.into())
    }

    pub fn out_of_range<S: Into<String>>(msg: S) -> Self {
        IrisError::OutOfRange(msg.into())
    }

    pub fn capacity<S: Into<String>>(msg: S) -> Self {
        IrisError::Capacity(msg.into())
    }

    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        IrisError::AlreadyClosed(msg.into())
    }

    pub fn aborted<S: Into<String>>(msg: S) -> Self {
        IrisError::Aborted(msg.into())
    }

    pub fn index<S: Into<String>>(msg: S) -> Self {
        IrisError::Index(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        IrisError::Internal(msg.into())
    }
}

/// Result type alias for indexing operations.
pub type Result<T> = std::result::Result<T, IrisError>;

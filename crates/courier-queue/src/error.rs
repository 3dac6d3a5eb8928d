//! Error types for queue operations.

use courier_persistence::PersistenceError;
use thiserror::Error;

/// Errors that can occur during queue operations.
///
/// "Nothing to reserve" and "duplicate suppressed" are not errors; those
/// operations return `Ok(None)`.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Message not found.
    #[error("message not found: {0}")]
    NotFound(String),

    /// Message is in invalid state for operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A dependency names a message that does not exist.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// The queue lock expired and was taken by someone else mid-operation.
    #[error("queue lock '{0}' lost before the operation completed")]
    LockLost(String),

    /// Persistence error.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

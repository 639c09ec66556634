//! Error types for the bus library.

use thiserror::Error;

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Errors that can occur in bus operations.
///
/// Transports never propagate these across broker boundaries; failures are
/// reported through the log sink and the affected message or connection is
/// dropped or retried (see the per-transport recovery rules).
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

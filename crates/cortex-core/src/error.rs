//! Error types for the cortex storage engine.

use thiserror::Error;

/// Result type alias using cortex's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cortex storage operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The fast store rejected a write because it would exceed its capacity.
    #[error("Capacity exceeded: {required} bytes required, {available} bytes available")]
    CapacityExceeded { required: u64, available: u64 },

    /// The transactional backend could not be opened.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A payload is too large for the only tier that is currently writable.
    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The user declined to grant an export target.
    #[error("Cancelled by user")]
    UserCancelled,

    /// Every stage of the write retry chain failed.
    #[error("Unrecoverable write for key {key}: {reason}")]
    Unrecoverable { key: String, reason: String },

    /// A backend transaction failed.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error can be resolved by freeing fast-store space.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

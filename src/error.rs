//! Error types for the hybrid memory backend.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`MemoryError`] enum. Conditions that the coordinator resolves locally
//! (lookup misses, partial dual-writes, query timeouts with partial answers)
//! are reported through return values rather than errors.
//!
//! # Examples
//!
//! ```
//! use hybrid_memory::error::{MemoryError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(MemoryError::validation("key must not be empty"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for hybrid memory operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// I/O errors (file operations, sync, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage-layer errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed entry or request. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A leaf backend is offline or otherwise unreachable.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// An operation exceeded its time bound.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A persisted index failed its integrity checks.
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// The store refused a new entry because it is full.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The coordinator has not finished initializing.
    #[error("Not ready: {0}")]
    NotReady(String),

    /// The coordinator was shut down.
    #[error("Closed: {0}")]
    Closed(String),

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with MemoryError.
pub type Result<T> = std::result::Result<T, MemoryError>;

impl MemoryError {
    /// Create a new validation error.
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        MemoryError::Validation(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        MemoryError::Storage(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        MemoryError::Serialization(msg.into())
    }

    /// Create a new backend-unavailable error.
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        MemoryError::BackendUnavailable(msg.into())
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        MemoryError::Timeout(msg.into())
    }

    /// Create a new corrupt-index error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        MemoryError::CorruptIndex(msg.into())
    }

    /// Create a new capacity error.
    pub fn capacity<S: Into<String>>(msg: S) -> Self {
        MemoryError::CapacityExceeded(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        MemoryError::InvalidConfig(msg.into())
    }

    /// Create a new closed error.
    pub fn closed<S: Into<String>>(msg: S) -> Self {
        MemoryError::Closed(msg.into())
    }

    /// Create a new not-ready error.
    pub fn not_ready<S: Into<String>>(msg: S) -> Self {
        MemoryError::NotReady(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        MemoryError::Other(msg.into())
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        MemoryError::Other(format!("Internal error: {}", msg.into()))
    }

    /// Whether a caller may reasonably retry the failed operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemoryError::BackendUnavailable(_) | MemoryError::Timeout(_) | MemoryError::Io(_)
        )
    }

    /// Whether this error means the leaf must be rebuilt before accepting writes.
    pub fn is_corruption(&self) -> bool {
        matches!(self, MemoryError::CorruptIndex(_))
    }
}

impl From<bincode::Error> for MemoryError {
    fn from(err: bincode::Error) -> Self {
        MemoryError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = MemoryError::validation("missing key");
        assert_eq!(error.to_string(), "Validation error: missing key");

        let error = MemoryError::corrupt("bad checksum");
        assert_eq!(error.to_string(), "Corrupt index: bad checksum");

        let error = MemoryError::unavailable("semantic leaf offline");
        assert_eq!(error.to_string(), "Backend unavailable: semantic leaf offline");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let memory_error = MemoryError::from(io_error);

        match memory_error {
            MemoryError::Io(_) => {} // Expected
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_retry_classification() {
        assert!(MemoryError::timeout("slow").is_retryable());
        assert!(MemoryError::unavailable("down").is_retryable());
        assert!(!MemoryError::validation("bad").is_retryable());
        assert!(MemoryError::corrupt("crc").is_corruption());
        assert!(!MemoryError::closed("bye").is_corruption());
    }
}

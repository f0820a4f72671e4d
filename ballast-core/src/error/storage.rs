//! Storage-related error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persistence error covering I/O failures, serialization errors and
/// write contract violations.
///
/// # Examples
///
/// ```
/// use ballast_core::error::StorageError;
///
/// let error = StorageError::Unavailable {
///     store: "diagnostics".to_string(),
///     reason: "connection refused".to_string(),
/// };
/// assert!(error.is_temporary());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageError {
    /// I/O operation failed.
    #[error("{operation} on '{path}' failed: {reason}")]
    IoError {
        /// Operation that failed (read, write, sync, ...).
        operation: String,
        /// Path to the file or resource.
        path: String,
        /// Reason for the I/O error.
        reason: String,
    },

    /// The backing store cannot be reached.
    #[error("store '{store}' unavailable: {reason}")]
    Unavailable {
        /// Logical store name.
        store: String,
        /// Reason reported by the backend.
        reason: String,
    },

    /// A write or read did not complete within its bound.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Serialization failed.
    #[error("cannot serialize record: {reason}")]
    SerializationError {
        /// Reason for the serialization error.
        reason: String,
    },

    /// An append-only record with this key already exists.
    #[error("record '{key}' already exists")]
    AlreadyExists {
        /// Key of the existing record.
        key: String,
    },

    /// A referenced record does not exist.
    #[error("record '{key}' not found")]
    NotFound {
        /// Key that was looked up.
        key: String,
    },
}

impl StorageError {
    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::IoError { .. }
        )
    }

    /// Returns the severity level of this error.
    #[must_use]
    pub fn severity(&self) -> super::ErrorSeverity {
        use super::ErrorSeverity;
        if self.is_temporary() {
            ErrorSeverity::Recoverable
        } else {
            ErrorSeverity::Warning
        }
    }

    /// Creates an I/O error from a `std::io::Error`.
    #[must_use]
    pub fn io(operation: &str, path: &str, err: &std::io::Error) -> Self {
        Self::IoError {
            operation: operation.to_string(),
            path: path.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_classification() {
        assert!(
            StorageError::Timeout {
                operation: "append".to_string(),
                timeout_ms: 100,
            }
            .is_temporary()
        );
        assert!(
            !StorageError::AlreadyExists {
                key: "run-1".to_string(),
            }
            .is_temporary()
        );
    }

    #[test]
    fn test_from_serde_json() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let storage: StorageError = err.into();
        assert!(matches!(storage, StorageError::SerializationError { .. }));
    }
}

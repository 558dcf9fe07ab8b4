//! Error types for the property store and the resource allocator.
//!
//! The store distinguishes three kinds of failure that callers branch on:
//! a broken backing file (`Io`, `LockTimeout`, `Codec`), a rejected
//! transaction (`Precondition`), and misuse (`InvalidKey`).

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by property store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be opened, locked, read or written.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A bounded lock wait expired before the lock was granted.
    #[error("timed out after {waited_ms}ms waiting for lock on {path}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    /// An action's expectation did not hold; nothing was written.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The backing file content is not valid UTF-8.
    #[error("cannot decode {path}: {reason}")]
    Codec { path: PathBuf, reason: String },

    /// Serialization or deserialization of a JSON value failed.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    TaskFailed(String),

    /// No tokio runtime is available to deliver watch callbacks.
    #[error("runtime unavailable: {0}")]
    Runtime(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if a transaction was rejected because an expectation was stale.
    ///
    /// Callers may recompute their actions and try again.
    pub fn is_precondition(&self) -> bool {
        matches!(self, StoreError::Precondition(_))
    }

    /// Returns true if the backing storage itself failed.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            StoreError::Io { .. } | StoreError::LockTimeout { .. } | StoreError::Codec { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::TaskFailed(err.to_string())
    }
}

/// Errors raised while obtaining resources.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Both generation phases finished short of the requested count.
    #[error("insufficient resources: requested {requested}, only {found} available")]
    InsufficientResources { requested: usize, found: usize },

    /// The request itself is malformed (e.g. minimum not a multiple of the group size).
    #[error("invalid resource request: {0}")]
    InvalidRequest(String),

    /// A resource pattern could not be compiled.
    #[error("invalid resource pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The in-use lookup failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResourceError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        ResourceError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::InvalidKey("key cannot be empty".to_string());
        assert!(err.to_string().contains("invalid key"));

        let err = StoreError::io(
            "/tmp/dss.properties",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/tmp/dss.properties"));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_error_kinds() {
        assert!(StoreError::Precondition("add a.b".to_string()).is_precondition());
        assert!(!StoreError::Precondition("add a.b".to_string()).is_io());
        assert!(StoreError::LockTimeout {
            path: PathBuf::from("/tmp/x"),
            waited_ms: 10
        }
        .is_io());
        assert!(!StoreError::InvalidKey(String::new()).is_io());
    }

    #[test]
    fn test_insufficient_display() {
        let err = ResourceError::InsufficientResources {
            requested: 3,
            found: 2,
        };
        assert!(err.to_string().contains("requested 3"));
        assert!(err.to_string().contains("only 2"));
    }

    #[test]
    fn test_store_error_converts() {
        let err: ResourceError = StoreError::Precondition("x".to_string()).into();
        assert!(matches!(err, ResourceError::Store(StoreError::Precondition(_))));
    }
}

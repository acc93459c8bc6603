use std::fmt;

use uuid::Uuid;

/// What went wrong inside an [`InstanceStore`](super::InstanceStore).
///
/// Only [`StoreFailure::Transient`] is worth retrying. The rest describe
/// state that another attempt will find unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFailure {
    /// Busy database, dropped connection, interrupted write
    Transient,
    /// A stored snapshot could not be decoded, or a snapshot could not be encoded
    CorruptSnapshot,
    /// A correlation key is already owned by a different instance
    KeyConflict,
    /// A save could not be staged behind the ambient transaction
    Staging,
    /// Anything else the backend rejected for good
    Storage,
}

/// Error returned by instance stores.
///
/// The host hands it to the executor as an infrastructure failure, which
/// aborts the instance; [`ProviderError::is_retryable`] tells the host
/// whether the same save or load could go through on a second try.
///
/// ```rust,no_run
/// use duroflow::providers::{ProviderError, StoreFailure};
/// use uuid::Uuid;
///
/// let (key, owner) = (Uuid::new_v4(), Uuid::new_v4());
/// let err = ProviderError::key_conflict(key, owner);
/// assert_eq!(err.failure, StoreFailure::KeyConflict);
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Store operation that failed, such as `save` or `associate_keys`
    pub operation: String,
    pub message: String,
    pub failure: StoreFailure,
}

impl ProviderError {
    pub fn new(operation: impl Into<String>, failure: StoreFailure, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            failure,
        }
    }

    /// The backend may accept the same request later.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, StoreFailure::Transient, message)
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, StoreFailure::Storage, message)
    }

    /// `key` cannot move to a new instance while `owner` holds it.
    pub fn key_conflict(key: Uuid, owner: impl fmt::Display) -> Self {
        Self::new(
            "associate_keys",
            StoreFailure::KeyConflict,
            format!("key {key} is already associated with instance {owner}"),
        )
    }

    /// Snapshot bytes did not round-trip through serde.
    pub fn corrupt_snapshot(operation: &str, e: serde_json::Error) -> Self {
        Self::new(operation, StoreFailure::CorruptSnapshot, format!("snapshot is not readable: {e}"))
    }

    /// The ambient transaction refused the staged save's enlistment.
    pub fn staging(reason: impl Into<String>) -> Self {
        Self::new("stage_save", StoreFailure::Staging, reason)
    }

    pub(crate) fn io(operation: &str, e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                Self::retryable(operation, format!("I/O error: {e}"))
            }
            _ => Self::permanent(operation, format!("I/O error: {e}")),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure == StoreFailure::Transient
    }

    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.is_retryable(),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

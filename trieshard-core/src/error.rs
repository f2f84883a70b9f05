//! Error types for the trieshard manager
//!
//! Covers registration, shard ownership, split protocol and transport
//! failures.

use thiserror::Error;

use crate::keyspace::KeyRange;

/// Primary error type for all manager operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManagerError {
    // ========== Validation Errors ==========

    /// A live worker already holds this identity
    #[error("Worker {worker_id} is already registered and alive")]
    Duplicate { worker_id: String },

    /// Split requested on a missing, busy or dead-owner shard
    #[error("Invalid split: {reason}")]
    InvalidSplit { reason: String },

    /// Registration address could not be parsed
    #[error("Invalid worker address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Worker id is not known to the registry
    #[error("Worker {worker_id} not registered")]
    WorkerNotRegistered { worker_id: String },

    // ========== Consistency Errors ==========

    /// Shard transfer attempted against a stale or partial partition
    #[error("Shard transfer conflict on {range}: {reason}")]
    Conflict { range: KeyRange, reason: String },

    /// No shard contains the key; the partition is broken
    #[error("No shard owns key {key:?}")]
    NotFound { key: String },

    /// The shard exists but has no live owner
    #[error("Shard {range} has no live owner")]
    Unavailable { range: KeyRange },

    // ========== Protocol Errors ==========

    /// Split acknowledgments did not arrive before the deadline
    #[error("Split operation {operation_id} timed out waiting for {missing:?}")]
    Timeout { operation_id: u64, missing: Vec<String> },

    /// Outbound RPC to a worker failed
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    // ========== Runtime Errors ==========

    /// Event loop has stopped accepting events
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ManagerError {
    /// Returns true if this error indicates a broken partition invariant
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            ManagerError::Conflict { .. } | ManagerError::NotFound { .. }
        )
    }

    /// Returns true if the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ManagerError::ConnectionFailed { .. }
                | ManagerError::Unavailable { .. }
                | ManagerError::InvalidSplit { .. }
        )
    }
}

/// Result type alias for manager operations
pub type Result<T> = std::result::Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let conflict = ManagerError::Conflict {
            range: KeyRange::full(),
            reason: "stale".into(),
        };
        assert!(conflict.is_consistency_violation());
        assert!(!conflict.is_retryable());

        let not_found = ManagerError::NotFound { key: "apple".into() };
        assert!(not_found.is_consistency_violation());

        let dup = ManagerError::Duplicate { worker_id: "a:1".into() };
        assert!(!dup.is_consistency_violation());
        assert!(!dup.is_retryable());
    }
}

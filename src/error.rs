// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the catalog replication engine.
//!
//! Errors are categorized by how far they reach: some abort the whole run
//! before or during schema migration, some only abort a single table's data
//! copy, and some are recoverable by re-reading the destination and trying
//! again.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Scope | Description |
//! |------------|-----------|-------|-------------|
//! | `Configuration` | No | Run | Source/destination structural incompatibility |
//! | `Authorization` | No | Run | Caller lacks ownership or ACL-read rights |
//! | `ConcurrentUpdate` | Yes | Node | Precondition failed against a stale snapshot |
//! | `Transfer` | Yes | Table | Paging or upload failure; marker stays at 1 |
//! | `Pipeline` | Yes | Table | Producer or consumer task failure |
//! | `Service` | Yes | Call | Unclassified catalog service failure |
//! | `InvalidState` | No | Engine | Lifecycle misuse (e.g. running twice) |
//! | `Cancelled` | No | Run | Cancellation requested |
//! | `Internal` | No | Run | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`CloneError::is_retryable()`] to decide whether rerunning is worth it.
//! Reruns are idempotent: the destination's progress markers and row cursor
//! carry all restart state.

use crate::service::ServiceError;
use thiserror::Error;

/// Result type alias for clone operations.
pub type Result<T> = std::result::Result<T, CloneError>;

/// Errors that can occur while cloning a catalog.
///
/// Each variant names the offending node (`schema:table`, column, key) where
/// one exists, so manual inspection is tractable.
#[derive(Error, Debug)]
pub enum CloneError {
    /// Structural incompatibility between source and destination.
    ///
    /// Column type/nullability/default mismatch, destination columns or keys
    /// absent from the source, unsupported foreign-key targets, invalid
    /// engine configuration. Never reconciled automatically.
    #[error("Configuration error ({node}): {message}")]
    Configuration { node: String, message: String },

    /// Caller lacks the rights the requested clone needs.
    ///
    /// Raised before any mutation when it can be detected up front.
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Configuration apply hit a precondition failure.
    ///
    /// Recoverable by re-fetching the destination and retrying the node.
    #[error("Concurrent update on {node}")]
    ConcurrentUpdate { node: String },

    /// Row paging or upload failed for one table.
    ///
    /// The table's progress marker is left at 1 so a rerun resumes from the
    /// destination's current cursor.
    #[error("Transfer error ({table}): {message}")]
    Transfer { table: String, message: String },

    /// A pipelined producer or consumer task failed.
    ///
    /// The sibling task has been cancelled and the queue closed.
    #[error("Pipeline error ({table}, {side}): {message}")]
    Pipeline {
        table: String,
        side: String,
        message: String,
    },

    /// Catalog service failure not covered by a more specific variant.
    #[error("Service error ({operation}): {message}")]
    Service {
        operation: String,
        message: String,
        #[source]
        source: Option<ServiceError>,
    },

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The run was cancelled.
    #[error("Clone cancelled")]
    Cancelled,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CloneError {
    /// Create a configuration error for a node.
    pub fn configuration(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create a transfer error for a table.
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Classify a service failure raised by `operation`.
    ///
    /// Forbidden responses become [`CloneError::Authorization`] and
    /// precondition failures become [`CloneError::ConcurrentUpdate`].
    pub fn service(operation: impl Into<String>, source: ServiceError) -> Self {
        let operation = operation.into();
        match source {
            ServiceError::Forbidden(message) => {
                Self::Authorization(format!("{operation}: {message}"))
            }
            ServiceError::PreconditionFailed(_) => Self::ConcurrentUpdate { node: operation },
            other => Self::Service {
                operation,
                message: other.to_string(),
                source: Some(other),
            },
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrentUpdate { .. } => true,
            Self::Transfer { .. } => true,
            Self::Pipeline { .. } => true,
            Self::Service { .. } => true,
            Self::Configuration { .. } => false, // needs operator intervention
            Self::Authorization(_) => false,
            Self::InvalidState { .. } => false,
            Self::Cancelled => false,
            Self::Internal(_) => false,
        }
    }

    /// Whether this error aborts the whole run rather than a single table.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::Authorization(_)
                | Self::InvalidState { .. }
                | Self::Cancelled
                | Self::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_retryable_configuration() {
        let err = CloneError::configuration("isa:dataset:title", "type mismatch text != int4");
        assert!(!err.is_retryable());
        assert!(err.is_fatal_for_run());
        assert!(err.to_string().contains("isa:dataset:title"));
    }

    #[test]
    fn test_is_retryable_transfer() {
        let err = CloneError::transfer("isa:dataset", "connection reset");
        assert!(err.is_retryable());
        assert!(!err.is_fatal_for_run());
        assert!(err.to_string().contains("isa:dataset"));
    }

    #[test]
    fn test_is_retryable_pipeline() {
        let err = CloneError::Pipeline {
            table: "isa:dataset".to_string(),
            side: "consumer".to_string(),
            message: "upload failed".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("consumer"));
    }

    #[test]
    fn test_service_forbidden_maps_to_authorization() {
        let err = CloneError::service("get_model", ServiceError::Forbidden("no read".into()));
        assert!(matches!(err, CloneError::Authorization(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_service_precondition_maps_to_concurrent_update() {
        let err = CloneError::service(
            "put_config isa:dataset",
            ServiceError::PreconditionFailed("etag".into()),
        );
        assert!(matches!(err, CloneError::ConcurrentUpdate { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_service_transport_stays_service() {
        let err = CloneError::service("fetch_page", ServiceError::Transport("timeout".into()));
        assert!(matches!(err, CloneError::Service { .. }));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("fetch_page"));
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = CloneError::InvalidState {
            expected: "Created".to_string(),
            actual: "Complete".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Complete"));
    }

    #[test]
    fn test_not_retryable_cancelled() {
        assert!(!CloneError::Cancelled.is_retryable());
    }
}

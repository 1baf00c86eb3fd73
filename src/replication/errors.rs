//! Replication error types
//!
//! Unreachable nodes are not errors at this layer: they select a fallback
//! path and show up in the `WriteOutcome`. What remains here is what the
//! coordinator cannot route around.

use std::fmt;

use crate::model::ModelError;
use crate::node::NodeError;

/// Replication error type
#[derive(Debug, Clone)]
pub struct ReplicationError {
    /// Error kind
    pub kind: ReplicationErrorKind,
    /// Error message
    pub message: String,
}

/// Replication error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationErrorKind {
    /// No safe id could be allocated; the insert is abandoned
    IdGenerationFailure,

    /// Request rejected at the boundary
    InvalidInput,

    /// Node layout is not usable
    ConfigurationError,

    /// Retry budget exhausted for a queued replication
    PermanentFailure,

    /// Write state machine received an event its state does not accept
    IllegalTransition,

    /// Key exists on no reachable node
    NotFound,

    /// Node failure that no fallback covers
    Node,
}

impl ReplicationError {
    pub fn new(kind: ReplicationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn id_generation(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::IdGenerationFailure, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::InvalidInput, message)
    }

    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::ConfigurationError, message)
    }

    pub fn permanent_failure(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::PermanentFailure, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::NotFound, message)
    }

    pub fn illegal_transition(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::IllegalTransition, message)
    }

    /// Fatal for the request: retrying the same call cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ReplicationErrorKind::InvalidInput
                | ReplicationErrorKind::ConfigurationError
                | ReplicationErrorKind::IllegalTransition
        )
    }
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicationError({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for ReplicationError {}

impl From<ModelError> for ReplicationError {
    fn from(err: ModelError) -> Self {
        Self::invalid_input(err.to_string())
    }
}

impl From<NodeError> for ReplicationError {
    fn from(err: NodeError) -> Self {
        Self::new(ReplicationErrorKind::Node, err.to_string())
    }
}

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;

    #[test]
    fn test_fatal_errors() {
        assert!(ReplicationError::invalid_input("x").is_fatal());
        assert!(ReplicationError::configuration_error("x").is_fatal());
        assert!(!ReplicationError::id_generation("x").is_fatal());
        assert!(!ReplicationError::permanent_failure("x").is_fatal());
    }

    #[test]
    fn test_conversions() {
        let err: ReplicationError = ModelError::EmptyChanges.into();
        assert_eq!(err.kind, ReplicationErrorKind::InvalidInput);

        let err: ReplicationError = NodeError::query(&NodeId::new("central"), "bad").into();
        assert_eq!(err.kind, ReplicationErrorKind::Node);
        assert!(err.message.contains("central"));
    }

    #[test]
    fn test_display() {
        let err = ReplicationError::id_generation("central and fragments unreachable");
        let text = err.to_string();
        assert!(text.contains("IdGenerationFailure"));
        assert!(text.contains("unreachable"));
    }
}

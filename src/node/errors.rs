//! Node access errors
//!
//! Connectivity failures are values, not panics: callers decide whether to
//! fall back to another node.

use thiserror::Error;

use super::config::NodeId;

/// Node error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorKind {
    /// Node unreachable, connection refused or lost
    Unavailable,

    /// Engine chose this transaction as a deadlock victim
    Deadlock,

    /// Lock wait exceeded the engine's timeout
    LockTimeout,

    /// Constraint violation (duplicate key)
    Constraint,

    /// Any other statement failure
    Query,

    /// Node is not configured
    UnknownNode,
}

/// Error from a single node.
#[derive(Debug, Clone, Error)]
#[error("NodeError({kind:?}) on {node}: {message}")]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub node: NodeId,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, node: &NodeId, message: impl Into<String>) -> Self {
        Self {
            kind,
            node: node.clone(),
            message: message.into(),
        }
    }

    pub fn unavailable(node: &NodeId, message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Unavailable, node, message)
    }

    pub fn deadlock(node: &NodeId, message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Deadlock, node, message)
    }

    pub fn lock_timeout(node: &NodeId, message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::LockTimeout, node, message)
    }

    pub fn constraint(node: &NodeId, message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Constraint, node, message)
    }

    pub fn query(node: &NodeId, message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Query, node, message)
    }

    pub fn unknown_node(node: &NodeId) -> Self {
        Self::new(NodeErrorKind::UnknownNode, node, "node is not configured")
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind == NodeErrorKind::Unavailable
    }

    /// Lock conflicts reported by the engine.
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self.kind, NodeErrorKind::Deadlock | NodeErrorKind::LockTimeout)
    }
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;

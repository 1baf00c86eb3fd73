use serde::Serialize;

use crate::model::TitleId;
use crate::node::NodeId;
use crate::txlog::TransactionId;

/// Result of a replicated write.
///
/// `Pending` is a success: the write is durable on one copy and the other
/// copy is owed through recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Applied on the owning fragment and on Central.
    Replicated { id: TitleId },

    /// Applied on `accepted_on`; replication toward `pending_toward` is queued.
    Pending {
        id: TitleId,
        transaction_id: TransactionId,
        accepted_on: NodeId,
        pending_toward: NodeId,
    },

    /// No node accepted the write. `id` is set when one had been allocated.
    AllTargetsUnreachable { id: Option<TitleId> },

    /// Update or delete of a key that exists nowhere. No node was written.
    NotFound { id: TitleId },
}

impl WriteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WriteOutcome::Replicated { .. } | WriteOutcome::Pending { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, WriteOutcome::Pending { .. })
    }

    pub fn id(&self) -> Option<&TitleId> {
        match self {
            WriteOutcome::Replicated { id }
            | WriteOutcome::Pending { id, .. }
            | WriteOutcome::NotFound { id } => Some(id),
            WriteOutcome::AllTargetsUnreachable { id } => id.as_ref(),
        }
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            WriteOutcome::Pending { transaction_id, .. } => Some(*transaction_id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOutcome::Replicated { .. } => "replicated",
            WriteOutcome::Pending { .. } => "pending",
            WriteOutcome::AllTargetsUnreachable { .. } => "all_targets_unreachable",
            WriteOutcome::NotFound { .. } => "not_found",
        }
    }
}

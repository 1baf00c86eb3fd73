use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::TitleId;
use crate::node::{Mutation, NodeId, Operation, SqlValue};

/// Globally unique transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Replication status of a log entry.
///
/// `Pending` moves to `Success` or `Failed` through replay; both of those
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxStatus {
    Success,
    Pending,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Success => "SUCCESS",
            TxStatus::Pending => "PENDING",
            TxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(TxStatus::Success),
            "PENDING" => Some(TxStatus::Pending),
            "FAILED" => Some(TxStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One replication attempt, persisted in a node's `transaction_log` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub transaction_id: TransactionId,
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub operation: Operation,
    pub record_id: TitleId,
    /// Replay statement for the target.
    pub statement: String,
    pub params: Vec<SqlValue>,
    /// Structured form of the same write, used for replay.
    pub payload: Mutation,
    pub status: TxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionLogEntry {
    pub fn new(
        source_node: NodeId,
        target_node: NodeId,
        mutation: Mutation,
        status: TxStatus,
        max_retries: u32,
    ) -> Self {
        let statement = mutation.statement();
        let now = Utc::now();
        Self {
            transaction_id: TransactionId::new(),
            source_node,
            target_node,
            operation: mutation.operation(),
            record_id: mutation.record_id().clone(),
            statement: statement.sql,
            params: statement.params,
            payload: mutation,
            status,
            retry_count: 0,
            max_retries,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTitle, TitleType};

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = TransactionId::new();
        let b = TransactionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<TransactionId>().unwrap(), a);
    }

    #[test]
    fn test_status_names() {
        assert_eq!(TxStatus::parse("PENDING"), Some(TxStatus::Pending));
        assert_eq!(TxStatus::Failed.as_str(), "FAILED");
        assert!(TxStatus::Success.is_terminal());
        assert!(!TxStatus::Pending.is_terminal());
    }

    #[test]
    fn test_entry_captures_replay_statement() {
        let mutation = Mutation::insert(TitleId::from_number(9), NewTitle::new(TitleType::Short, "Pip"));
        let entry = TransactionLogEntry::new(
            NodeId::new("others"),
            NodeId::new("central"),
            mutation.clone(),
            TxStatus::Pending,
            5,
        )
        .with_error("connection refused");

        assert_eq!(entry.operation, Operation::Insert);
        assert_eq!(entry.record_id, TitleId::from_number(9));
        assert_eq!(entry.statement, mutation.statement().sql);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.error_message.as_deref(), Some("connection refused"));
    }
}

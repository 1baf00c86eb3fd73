use std::sync::Arc;

use tracing::{debug, warn};

use super::entry::{TransactionId, TransactionLogEntry, TxStatus};
use crate::node::{LogQuery, Mutation, NodeId, NodeRegistry, NodeResult};
use crate::observability::MetricsRegistry;

/// Where a log entry ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction_id: TransactionId,
    /// `None` when neither node could store the entry.
    pub stored_on: Option<NodeId>,
}

/// Writes replication attempts to the nodes' `transaction_log` tables.
///
/// Logging is best effort: an entry goes to the source node, then to the
/// target, and is otherwise dropped with a warning. It never changes the
/// result of the write it describes.
pub struct TransactionLogger {
    registry: Arc<NodeRegistry>,
    max_retries: u32,
    metrics: Arc<MetricsRegistry>,
}

impl TransactionLogger {
    pub fn new(registry: Arc<NodeRegistry>, max_retries: u32, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            registry,
            max_retries,
            metrics,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn log(
        &self,
        source: &NodeId,
        target: &NodeId,
        mutation: Mutation,
        status: TxStatus,
        error: Option<&str>,
    ) -> TransactionReceipt {
        let mut entry = TransactionLogEntry::new(
            source.clone(),
            target.clone(),
            mutation,
            status,
            self.max_retries,
        );
        if let Some(error) = error {
            entry = entry.with_error(error);
        }
        let transaction_id = entry.transaction_id;

        for node in [source, target] {
            match self.store(node, &entry).await {
                Ok(()) => {
                    if node == target {
                        self.metrics.increment_log_fallback();
                    }
                    debug!(
                        transaction_id = %transaction_id,
                        node = %node,
                        status = %status,
                        operation = %entry.operation,
                        key = %entry.record_id,
                        "transaction logged"
                    );
                    return TransactionReceipt {
                        transaction_id,
                        stored_on: Some(node.clone()),
                    };
                }
                Err(err) => {
                    warn!(transaction_id = %transaction_id, node = %node, error = %err, "transaction log write failed");
                }
            }
        }

        self.metrics.increment_log_dropped();
        warn!(
            transaction_id = %transaction_id,
            source = %source,
            target = %target,
            "transaction log entry dropped"
        );
        TransactionReceipt {
            transaction_id,
            stored_on: None,
        }
    }

    async fn store(&self, node: &NodeId, entry: &TransactionLogEntry) -> NodeResult<()> {
        let mut session = self
            .registry
            .connect_with_attempts(node, self.registry.default_isolation(), 1)
            .await?;
        session.append_log(entry).await
    }

    /// Moves a pending entry to `status`; returns false when the entry is
    /// missing or already terminal.
    pub async fn update_status(
        &self,
        node: &NodeId,
        id: &TransactionId,
        status: TxStatus,
        error: Option<&str>,
    ) -> NodeResult<bool> {
        let mut session = self.registry.connect(node, self.registry.default_isolation()).await?;
        session.set_log_status(id, status, error).await
    }

    pub async fn increment_retry(&self, node: &NodeId, id: &TransactionId) -> NodeResult<bool> {
        let mut session = self.registry.connect(node, self.registry.default_isolation()).await?;
        session.bump_log_retry(id).await
    }

    /// Pending entries that still have retry budget, oldest first.
    pub async fn list_pending(&self, node: &NodeId) -> NodeResult<Vec<TransactionLogEntry>> {
        let mut session = self.registry.connect(node, self.registry.default_isolation()).await?;
        let pending = session.select_logs(LogQuery::Pending).await?;
        Ok(pending
            .into_iter()
            .filter(|e| e.retry_count < e.max_retries)
            .collect())
    }

    /// Failed entries plus pending ones whose retry budget is spent.
    pub async fn list_failed(&self, node: &NodeId) -> NodeResult<Vec<TransactionLogEntry>> {
        let mut session = self.registry.connect(node, self.registry.default_isolation()).await?;
        let mut failed = session.select_logs(LogQuery::Failed).await?;
        let exhausted = session
            .select_logs(LogQuery::Pending)
            .await?
            .into_iter()
            .filter(|e| e.retry_count >= e.max_retries);
        failed.extend(exhausted);
        failed.sort_by_key(|e| e.created_at);
        Ok(failed)
    }

    /// Newest entries first.
    pub async fn recent(&self, node: &NodeId, limit: u32) -> NodeResult<Vec<TransactionLogEntry>> {
        let mut session = self.registry.connect(node, self.registry.default_isolation()).await?;
        session.select_logs(LogQuery::Recent(limit)).await
    }
}

//! Replay of pending replications
//!
//! A sweep drains the entries addressed to one node and applies them in
//! their original order over a single session. Drained entries stay visible
//! to writers as in flight until they settle. Replays carry the accepting
//! node's `last_updated`, and inserts replay as upserts, so replaying an
//! entry that already landed is harmless.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as SweepLock;
use tracing::{error, info, warn};

use super::queue::{PendingQueue, PendingReplication};
use crate::model::TitleId;
use crate::node::{NodeError, NodeId, NodeRegistry, NodeResult};
use crate::observability::MetricsRegistry;
use crate::replication::ReplicationError;
use crate::txlog::{TransactionLogger, TxStatus};

/// Result of one recovery sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub node: NodeId,
    pub recovered: usize,
    /// Entries still queued for this node after the sweep.
    pub still_pending: usize,
    /// Entries given up on during this sweep.
    pub failed: usize,
}

pub struct RecoveryHandler {
    registry: Arc<NodeRegistry>,
    logger: Arc<TransactionLogger>,
    queue: PendingQueue,
    sweeps: Mutex<HashMap<NodeId, Arc<SweepLock<()>>>>,
    metrics: Arc<MetricsRegistry>,
}

impl RecoveryHandler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        logger: Arc<TransactionLogger>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            registry,
            logger,
            queue: PendingQueue::new(),
            sweeps: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn enqueue(&self, item: PendingReplication) {
        info!(
            transaction_id = %item.transaction_id,
            target = %item.target,
            operation = %item.operation(),
            key = %item.record_id(),
            "replication queued"
        );
        self.queue.push(item);
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_for(&self, node: &NodeId) -> usize {
        self.queue.count_for(node)
    }

    pub fn pending(&self) -> Vec<PendingReplication> {
        self.queue.snapshot()
    }

    /// Writes for `key` toward `target` must wait behind this entry, whether
    /// it is queued or replaying.
    pub fn has_pending(&self, target: &NodeId, key: &TitleId) -> bool {
        self.queue.has_pending(target, key)
    }

    pub fn max_pending_insert_number(&self) -> Option<u64> {
        self.queue.max_pending_insert_number()
    }

    fn sweep_lock(&self, node: &NodeId) -> Arc<SweepLock<()>> {
        self.sweeps
            .lock()
            .entry(node.clone())
            .or_insert_with(|| Arc::new(SweepLock::new(())))
            .clone()
    }

    /// Replays everything queued for `node`. Waits for a sweep already
    /// running on the same node.
    pub async fn recover(&self, node: &NodeId) -> NodeResult<RecoveryReport> {
        if self.registry.node(node).is_none() {
            return Err(NodeError::unknown_node(node));
        }
        let lock = self.sweep_lock(node);
        let _guard = lock.lock().await;
        Ok(self.sweep(node).await)
    }

    /// Like `recover`, but returns `None` when a sweep is already running.
    pub async fn try_recover(&self, node: &NodeId) -> Option<RecoveryReport> {
        self.registry.node(node)?;
        let lock = self.sweep_lock(node);
        let _guard = lock.try_lock().ok()?;
        Some(self.sweep(node).await)
    }

    /// Sweeps every node that has queued work and answers a probe.
    pub async fn recover_reachable(&self) -> Vec<RecoveryReport> {
        let mut reports = Vec::new();
        for node in self.registry.partition().all_nodes() {
            if self.queue.queued_for(node) == 0 || !self.registry.check_node(node).await {
                continue;
            }
            if let Some(report) = self.try_recover(node).await {
                reports.push(report);
            }
        }
        reports
    }

    async fn sweep(&self, node: &NodeId) -> RecoveryReport {
        self.metrics.increment_recovery_runs();
        let mut remaining: Vec<PendingReplication> = self.queue.take_for(node);
        let mut recovered = 0;
        let mut failed = 0;

        if remaining.is_empty() {
            return self.report(node, recovered, failed);
        }

        let mut session = match self
            .registry
            .connect(node, self.registry.default_isolation())
            .await
        {
            Ok(session) => session,
            Err(err) => {
                info!(node = %node, pending = remaining.len(), error = %err, "node still unreachable");
                self.queue.restore(remaining);
                return self.report(node, recovered, failed);
            }
        };

        // Keys whose replay failed this sweep; later entries for them wait.
        let mut blocked: HashSet<TitleId> = HashSet::new();
        remaining.reverse();
        while let Some(mut item) = remaining.pop() {
            if blocked.contains(item.record_id()) {
                self.queue.requeue(item);
                continue;
            }
            match session.apply(&item.mutation).await {
                Ok(_) => {
                    recovered += 1;
                    self.mark(&item, TxStatus::Success, None).await;
                    self.queue.settle(&item.transaction_id);
                }
                Err(err) if err.is_unavailable() => {
                    // Node dropped mid-sweep; nothing was consumed.
                    warn!(node = %node, error = %err, "node lost during recovery");
                    remaining.push(item);
                    remaining.reverse();
                    self.queue.restore(std::mem::take(&mut remaining));
                    break;
                }
                Err(err) => {
                    item.retry_count += 1;
                    self.bump_retry(&item).await;
                    if item.retry_count >= self.logger.max_retries() {
                        failed += 1;
                        let failure = ReplicationError::permanent_failure(format!(
                            "{} of {} toward {} failed {} times: {}",
                            item.operation(),
                            item.record_id(),
                            item.target,
                            item.retry_count,
                            err
                        ));
                        error!(transaction_id = %item.transaction_id, error = %failure, "replication abandoned");
                        self.mark(&item, TxStatus::Failed, Some(&failure.message)).await;
                        self.queue.settle(&item.transaction_id);
                    } else {
                        warn!(
                            transaction_id = %item.transaction_id,
                            retry = item.retry_count,
                            error = %err,
                            "replay failed, requeued"
                        );
                        blocked.insert(item.record_id().clone());
                        self.queue.requeue(item);
                    }
                }
            }
        }

        self.metrics.add_recovery_replayed(recovered as u64);
        self.metrics.add_recovery_failed(failed as u64);
        let report = self.report(node, recovered, failed);
        info!(
            node = %node,
            recovered = report.recovered,
            still_pending = report.still_pending,
            failed = report.failed,
            "recovery sweep finished"
        );
        report
    }

    fn report(&self, node: &NodeId, recovered: usize, failed: usize) -> RecoveryReport {
        RecoveryReport {
            node: node.clone(),
            recovered,
            still_pending: self.queue.queued_for(node),
            failed,
        }
    }

    async fn mark(&self, item: &PendingReplication, status: TxStatus, error: Option<&str>) {
        let Some(log_node) = &item.log_node else {
            return;
        };
        if let Err(err) = self
            .logger
            .update_status(log_node, &item.transaction_id, status, error)
            .await
        {
            warn!(transaction_id = %item.transaction_id, node = %log_node, error = %err, "log status update failed");
        }
    }

    async fn bump_retry(&self, item: &PendingReplication) {
        let Some(log_node) = &item.log_node else {
            return;
        };
        if let Err(err) = self.logger.increment_retry(log_node, &item.transaction_id).await {
            warn!(transaction_id = %item.transaction_id, node = %log_node, error = %err, "retry count update failed");
        }
    }

    /// Reloads PENDING log entries from every reachable node into the queue.
    /// Entries already queued are skipped. Returns the number added.
    pub async fn rehydrate(&self) -> usize {
        let mut found = Vec::new();
        for node in self.registry.partition().all_nodes() {
            match self.logger.list_pending(node).await {
                Ok(entries) => found.extend(
                    entries
                        .iter()
                        .map(|entry| PendingReplication::from_log(entry, node.clone())),
                ),
                Err(err) => warn!(node = %node, error = %err, "cannot read pending log entries"),
            }
        }
        found.sort_by_key(|item| item.enqueued_at);

        let mut added = 0;
        for item in found {
            if !self.queue.contains(&item.transaction_id) {
                self.queue.push(item);
                added += 1;
            }
        }
        info!(added, "pending replications reloaded from transaction logs");
        added
    }
}

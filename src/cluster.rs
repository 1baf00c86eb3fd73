//! Cluster handle
//!
//! Wires the registry, transaction logger, recovery handler, coordinator
//! and harness around one connector and one metrics registry. This is the
//! surface the CLI and the integration tests drive.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::harness::{
    ConcurrencyHarness, ConflictReport, ExperimentKind, ExperimentReport, HarnessResult,
    ReadReport, WriteContentionReport,
};
use crate::model::{NewTitle, Page, Pagination, Title, TitleChanges, TitleFilter, TitleId, TitleType};
use crate::node::{
    Connector, IsolationLevel, MySqlConnector, NodeHealth, NodeId, NodeRegistry, NodeResult,
};
use crate::observability::{MetricsRegistry, MetricsSnapshot};
use crate::recovery::{AutoRecovery, PendingReplication, RecoveryHandler, RecoveryReport};
use crate::replication::{ReplicationCoordinator, ReplicationError, ReplicationResult, WriteOutcome};
use crate::txlog::{TransactionLogEntry, TransactionLogger};

pub struct Cluster {
    config: Config,
    metrics: Arc<MetricsRegistry>,
    registry: Arc<NodeRegistry>,
    logger: Arc<TransactionLogger>,
    recovery: Arc<RecoveryHandler>,
    coordinator: Arc<ReplicationCoordinator>,
    harness: ConcurrencyHarness,
    auto_recovery: AutoRecovery,
}

impl Cluster {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> ReplicationResult<Self> {
        let metrics = Arc::new(MetricsRegistry::new());
        let registry = Arc::new(
            NodeRegistry::new(
                config.nodes.clone(),
                connector,
                config.connection,
                Arc::clone(&metrics),
            )?
            .with_default_isolation(config.default_isolation)
            .with_list_order(config.list_order),
        );
        let logger = Arc::new(TransactionLogger::new(
            Arc::clone(&registry),
            config.replication.max_retries,
            Arc::clone(&metrics),
        ));
        let recovery = Arc::new(RecoveryHandler::new(
            Arc::clone(&registry),
            Arc::clone(&logger),
            Arc::clone(&metrics),
        ));
        let coordinator = Arc::new(ReplicationCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&logger),
            Arc::clone(&recovery),
            Arc::clone(&metrics),
        ));
        let harness = ConcurrencyHarness::new(Arc::clone(&coordinator), config.harness);
        let auto_recovery =
            AutoRecovery::new(Arc::clone(&recovery), config.replication.recovery_interval());

        Ok(Self {
            config,
            metrics,
            registry,
            logger,
            recovery,
            coordinator,
            harness,
            auto_recovery,
        })
    }

    /// Cluster over MySQL nodes.
    pub fn mysql(config: Config) -> ReplicationResult<Self> {
        let connector = Arc::new(MySqlConnector::new(config.connection.connect_timeout()));
        Self::new(config, connector)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<ReplicationCoordinator> {
        &self.coordinator
    }

    pub fn harness(&self) -> &ConcurrencyHarness {
        &self.harness
    }

    // ==================== Lifecycle ====================

    /// Creates the tables on every node.
    pub async fn init(&self) -> Vec<(NodeId, NodeResult<()>)> {
        self.registry.ensure_schema().await
    }

    /// Waits for every node, reloads pending log entries, and starts the
    /// recovery loop when configured. Returns the number of reloaded
    /// entries.
    pub async fn start(&self) -> NodeResult<usize> {
        self.registry.wait_for_all().await?;
        let reloaded = self.recovery.rehydrate().await;
        if self.config.replication.auto_recovery {
            self.auto_recovery.start();
        }
        info!(nodes = self.registry.nodes().len(), reloaded, "cluster started");
        Ok(reloaded)
    }

    pub fn start_auto_recovery(&self) -> bool {
        self.auto_recovery.start()
    }

    pub fn auto_recovery_running(&self) -> bool {
        self.auto_recovery.is_running()
    }

    pub async fn shutdown(&self) {
        self.auto_recovery.stop().await;
    }

    // ==================== Writes ====================

    pub async fn insert(&self, fields: NewTitle) -> ReplicationResult<WriteOutcome> {
        self.coordinator.insert(fields).await
    }

    pub async fn update(
        &self,
        id: &TitleId,
        changes: TitleChanges,
        isolation: IsolationLevel,
    ) -> ReplicationResult<WriteOutcome> {
        self.coordinator.update(id, changes, isolation).await
    }

    pub async fn delete(&self, id: &TitleId) -> ReplicationResult<WriteOutcome> {
        self.coordinator.delete(id).await
    }

    // ==================== Reads ====================

    pub async fn get_by_key(&self, id: &TitleId) -> ReplicationResult<Title> {
        self.registry
            .get_by_key(id)
            .await?
            .ok_or_else(|| ReplicationError::not_found(format!("title {} not found", id)))
    }

    pub async fn list(
        &self,
        page: u64,
        page_size: u64,
        title_type: Option<TitleType>,
    ) -> NodeResult<Page> {
        self.registry
            .list(Pagination::new(page, page_size), title_type)
            .await
    }

    pub async fn search(&self, filter: &TitleFilter, page: u64, page_size: u64) -> NodeResult<Page> {
        self.registry
            .search(filter, Pagination::new(page, page_size))
            .await
    }

    pub async fn health(&self) -> BTreeMap<NodeId, NodeHealth> {
        self.registry.health().await
    }

    // ==================== Recovery ====================

    pub async fn recover(&self, node: &NodeId) -> NodeResult<RecoveryReport> {
        self.recovery.recover(node).await
    }

    pub async fn recover_reachable(&self) -> Vec<RecoveryReport> {
        self.recovery.recover_reachable().await
    }

    pub async fn rehydrate(&self) -> usize {
        self.recovery.rehydrate().await
    }

    pub fn pending_count(&self) -> usize {
        self.recovery.pending_count()
    }

    /// Queued entries per target node.
    pub fn pending_by_node(&self) -> BTreeMap<NodeId, usize> {
        self.registry
            .partition()
            .all_nodes()
            .map(|node| (node.clone(), self.recovery.pending_for(node)))
            .collect()
    }

    pub fn pending(&self) -> Vec<PendingReplication> {
        self.recovery.pending()
    }

    // ==================== Transaction logs ====================

    pub async fn transaction_logs(
        &self,
        node: &NodeId,
        limit: u32,
    ) -> NodeResult<Vec<TransactionLogEntry>> {
        self.logger.recent(node, limit).await
    }

    pub async fn pending_logs(&self, node: &NodeId) -> NodeResult<Vec<TransactionLogEntry>> {
        self.logger.list_pending(node).await
    }

    pub async fn failed_logs(&self, node: &NodeId) -> NodeResult<Vec<TransactionLogEntry>> {
        self.logger.list_failed(node).await
    }

    // ==================== Experiments ====================

    pub async fn run_concurrent_reads(
        &self,
        key: &TitleId,
        isolation: IsolationLevel,
    ) -> HarnessResult<ReadReport> {
        self.harness.run_concurrent_reads(key, isolation).await
    }

    pub async fn run_read_write_conflict(
        &self,
        key: &TitleId,
        new_values: Vec<TitleChanges>,
        isolation: IsolationLevel,
    ) -> HarnessResult<ConflictReport> {
        self.harness
            .run_read_write_conflict(key, new_values, isolation)
            .await
    }

    pub async fn run_concurrent_writes(
        &self,
        key: &TitleId,
        value_sets: Vec<TitleChanges>,
        isolation: IsolationLevel,
    ) -> HarnessResult<WriteContentionReport> {
        self.harness
            .run_concurrent_writes(key, value_sets, isolation)
            .await
    }

    pub async fn run_isolation_sweep(
        &self,
        kind: ExperimentKind,
        key: &TitleId,
        change_sets: Vec<TitleChanges>,
    ) -> HarnessResult<Vec<ExperimentReport>> {
        self.harness.sweep(kind, key, change_sets).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

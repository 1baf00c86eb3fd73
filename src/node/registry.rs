//! Node registry
//!
//! Owns the node descriptors and the connector, and implements the
//! routing rules for reads. Every per-call connectivity failure comes back
//! as a `NodeError` value so callers can pick a fallback.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::{ConnectionSettings, NodeConfig, NodeId};
use super::errors::{NodeError, NodeResult};
use super::isolation::IsolationLevel;
use super::mutation::Mutation;
use super::session::{Connector, NodeSession, ReadMode};
use crate::model::{sort_titles, Page, Pagination, SortKey, Title, TitleFilter, TitleId, TitleQuery, TitleType, Window};
use crate::observability::MetricsRegistry;
use crate::replication::{PartitionMap, ReplicationResult};

/// Reachability of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeHealth {
    /// A connection could be opened.
    pub online: bool,
    /// The node answered a query.
    pub healthy: bool,
    pub record_count: Option<u64>,
}

pub struct NodeRegistry {
    nodes: Vec<NodeConfig>,
    partition: PartitionMap,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    default_isolation: IsolationLevel,
    list_order: SortKey,
    metrics: Arc<MetricsRegistry>,
}

impl NodeRegistry {
    pub fn new(
        nodes: Vec<NodeConfig>,
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> ReplicationResult<Self> {
        let partition = PartitionMap::from_nodes(&nodes)?;
        Ok(Self {
            nodes,
            partition,
            connector,
            settings,
            default_isolation: IsolationLevel::default(),
            list_order: SortKey::default(),
            metrics,
        })
    }

    pub fn with_default_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    pub fn with_list_order(mut self, order: SortKey) -> Self {
        self.list_order = order;
        self
    }

    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    pub fn partition(&self) -> &PartitionMap {
        &self.partition
    }

    pub fn central(&self) -> &NodeId {
        self.partition.central()
    }

    /// Owning fragment for a title type.
    pub fn primary(&self, title_type: TitleType) -> &NodeId {
        self.partition.primary(title_type)
    }

    pub fn default_isolation(&self) -> IsolationLevel {
        self.default_isolation
    }

    pub fn list_order(&self) -> SortKey {
        self.list_order
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Opens a session using the configured number of attempts.
    pub async fn connect(
        &self,
        node: &NodeId,
        isolation: IsolationLevel,
    ) -> NodeResult<Box<dyn NodeSession>> {
        self.connect_with_attempts(node, isolation, self.settings.attempts)
            .await
    }

    /// Opens a session, retrying with a fixed delay. Only unavailability is
    /// retried.
    pub async fn connect_with_attempts(
        &self,
        node: &NodeId,
        isolation: IsolationLevel,
        attempts: u32,
    ) -> NodeResult<Box<dyn NodeSession>> {
        let config = self.node(node).ok_or_else(|| NodeError::unknown_node(node))?;
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connector.open(config, isolation).await {
                Ok(session) => return Ok(session),
                Err(err) => {
                    self.metrics.increment_connect_failures();
                    if !err.is_unavailable() || attempt >= attempts {
                        debug!(node = %node, attempt, error = %err, "connect failed");
                        return Err(err);
                    }
                    debug!(node = %node, attempt, error = %err, "connect failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.settings.retry_delay()).await;
                }
            }
        }
    }

    /// Single connect attempt plus a trivial query.
    pub async fn check_node(&self, node: &NodeId) -> bool {
        match self
            .connect_with_attempts(node, self.default_isolation, 1)
            .await
        {
            Ok(mut session) => session.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    /// Applies one mutation in its own transaction.
    pub async fn execute_write(
        &self,
        node: &NodeId,
        mutation: &Mutation,
        isolation: IsolationLevel,
    ) -> NodeResult<u64> {
        let mut session = self.connect(node, isolation).await?;
        session.begin().await?;
        match session.apply(mutation).await {
            Ok(rows) => {
                session.commit().await?;
                Ok(rows)
            }
            Err(err) => {
                let _ = session.rollback().await;
                Err(err)
            }
        }
    }

    pub async fn execute_read(&self, node: &NodeId, query: &TitleQuery) -> NodeResult<Vec<Title>> {
        let mut session = self.connect(node, self.default_isolation).await?;
        session.query_titles(query).await
    }

    pub async fn execute_read_one(&self, node: &NodeId, id: &TitleId) -> NodeResult<Option<Title>> {
        let mut session = self.connect(node, self.default_isolation).await?;
        session.fetch_title(id, ReadMode::Plain).await
    }

    pub async fn count(&self, node: &NodeId, filter: &TitleFilter) -> NodeResult<u64> {
        let mut session = self.connect(node, self.default_isolation).await?;
        session.count_titles(filter).await
    }

    /// Looks a title up on Central, then on each fragment in configuration
    /// order.
    ///
    /// A node that is unreachable, or does not hold the key, is skipped.
    /// Returns `Ok(None)` when no reachable node has the key and an error
    /// only when no node was reachable at all.
    pub async fn get_by_key(&self, id: &TitleId) -> NodeResult<Option<Title>> {
        let mut last_error = None;
        let mut reached = false;

        for node in self.partition.all_nodes() {
            match self.execute_read_one(node, id).await {
                Ok(Some(title)) => {
                    if !self.partition.is_central(node) {
                        self.metrics.increment_read_fallbacks();
                    }
                    return Ok(Some(title));
                }
                Ok(None) => reached = true,
                Err(err) => {
                    warn!(node = %node, key = %id, error = %err, "lookup failed, trying next node");
                    last_error = Some(err);
                }
            }
        }

        match (reached, last_error) {
            (false, Some(err)) => Err(err),
            _ => Ok(None),
        }
    }

    /// Filtered, paginated read with Central-first routing.
    pub async fn search(&self, filter: &TitleFilter, pagination: Pagination) -> NodeResult<Page> {
        let central = self.partition.central();
        match self.page_from(central, filter, pagination).await {
            Ok(page) => return Ok(page),
            Err(err) if err.is_unavailable() => {
                warn!(node = %central, error = %err, "central unreachable, reading from fragments");
                self.metrics.increment_read_fallbacks();
            }
            Err(err) => return Err(err),
        }

        if let Some(fragment) = self.partition.pinned_fragment(filter.title_type) {
            return self.page_from(fragment, filter, pagination).await;
        }
        self.merged_page(filter, pagination).await
    }

    /// Listing with an optional title type filter.
    pub async fn list(&self, pagination: Pagination, title_type: Option<TitleType>) -> NodeResult<Page> {
        self.search(&TitleFilter::by_type(title_type), pagination)
            .await
    }

    async fn page_from(
        &self,
        node: &NodeId,
        filter: &TitleFilter,
        pagination: Pagination,
    ) -> NodeResult<Page> {
        let mut session = self.connect(node, self.default_isolation).await?;
        let query = TitleQuery::paged(filter.clone(), self.list_order, pagination);
        let items = session.query_titles(&query).await?;
        let total = session.count_titles(filter).await?;
        Ok(Page {
            items,
            total,
            page: pagination.page,
            page_size: pagination.page_size,
        })
    }

    /// Merges the top of every fragment, then slices the requested page.
    /// Fragments are disjoint, so no deduplication is needed.
    async fn merged_page(&self, filter: &TitleFilter, pagination: Pagination) -> NodeResult<Page> {
        let window = pagination.window();
        let query = TitleQuery {
            filter: filter.clone(),
            sort: self.list_order,
            window: Some(Window {
                offset: 0,
                limit: window.offset.saturating_add(window.limit),
            }),
        };

        let mut merged = Vec::new();
        let mut total = 0;
        let mut reached = false;
        let mut last_error = None;

        for fragment in self.partition.fragments() {
            let result = async {
                let mut session = self.connect(fragment, self.default_isolation).await?;
                let rows = session.query_titles(&query).await?;
                let count = session.count_titles(filter).await?;
                Ok::<_, NodeError>((rows, count))
            }
            .await;

            match result {
                Ok((rows, count)) => {
                    reached = true;
                    merged.extend(rows);
                    total += count;
                }
                Err(err) => {
                    warn!(node = %fragment, error = %err, "fragment unreachable, page is partial");
                    last_error = Some(err);
                }
            }
        }

        if let (false, Some(err)) = (reached, last_error) {
            return Err(err);
        }

        sort_titles(&mut merged, self.list_order);
        Ok(Page {
            items: pagination.slice(merged),
            total,
            page: pagination.page,
            page_size: pagination.page_size,
        })
    }

    /// Probes every node concurrently.
    pub async fn health(&self) -> BTreeMap<NodeId, NodeHealth> {
        let probes = self.nodes.iter().map(|node| async move {
            let health = match self
                .connect_with_attempts(&node.id, self.default_isolation, 1)
                .await
            {
                Ok(mut session) => {
                    let count = session.count_titles(&TitleFilter::default()).await;
                    NodeHealth {
                        online: true,
                        healthy: count.is_ok(),
                        record_count: count.ok(),
                    }
                }
                Err(_) => NodeHealth {
                    online: false,
                    healthy: false,
                    record_count: None,
                },
            };
            (node.id.clone(), health)
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Blocks until every node accepts a connection or the startup budget is
    /// spent.
    pub async fn wait_for_all(&self) -> NodeResult<()> {
        for node in &self.nodes {
            let mut attempt = 1;
            loop {
                let probe = self
                    .connect_with_attempts(&node.id, self.default_isolation, 1)
                    .await;
                let probe = match probe {
                    Ok(mut session) => session.ping().await,
                    Err(err) => Err(err),
                };
                match probe {
                    Ok(()) => {
                        info!(node = %node.id, address = %node.address(), "node ready");
                        break;
                    }
                    Err(err) if attempt >= self.settings.startup_attempts.max(1) => {
                        return Err(err);
                    }
                    Err(err) => {
                        info!(node = %node.id, attempt, error = %err, "waiting for node");
                        attempt += 1;
                        tokio::time::sleep(self.settings.startup_delay()).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Creates the tables on every node, reporting each node's result.
    pub async fn ensure_schema(&self) -> Vec<(NodeId, NodeResult<()>)> {
        let mut results = Vec::new();
        for node in &self.nodes {
            let result = match self.connect(&node.id, self.default_isolation).await {
                Ok(mut session) => session.ensure_schema().await,
                Err(err) => Err(err),
            };
            results.push((node.id.clone(), result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTitle;
    use crate::node::MemoryConnector;
    use chrono::{TimeZone, Utc};

    fn layout() -> Vec<NodeConfig> {
        vec![
            NodeConfig::central("central"),
            NodeConfig::fragment("movies", vec![TitleType::Movie]),
            NodeConfig::catch_all_fragment("others"),
        ]
    }

    fn registry() -> (NodeRegistry, MemoryConnector) {
        let connector = MemoryConnector::for_nodes(&layout());
        let settings = ConnectionSettings {
            attempts: 2,
            retry_delay_ms: 1,
            ..Default::default()
        };
        let registry = NodeRegistry::new(
            layout(),
            Arc::new(connector.clone()),
            settings,
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        (registry, connector)
    }

    fn title(n: u64, t: TitleType, year: i32) -> Title {
        NewTitle::new(t, format!("title {}", n))
            .with_start_year(year)
            .into_title(
                TitleId::from_number(n),
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            )
    }

    #[tokio::test]
    async fn test_connect_unknown_node() {
        let (registry, _) = registry();
        let err = registry
            .connect(&NodeId::new("nowhere"), IsolationLevel::ReadCommitted)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, crate::node::NodeErrorKind::UnknownNode);
    }

    #[tokio::test]
    async fn test_check_node_follows_availability() {
        let (registry, connector) = registry();
        let movies = NodeId::new("movies");
        assert!(registry.check_node(&movies).await);
        connector.node(&movies).unwrap().set_online(false);
        assert!(!registry.check_node(&movies).await);
    }

    #[tokio::test]
    async fn test_get_by_key_falls_through_to_fragments() {
        let (registry, connector) = registry();
        let row = title(5, TitleType::Movie, 2000);
        connector.node(&NodeId::new("movies")).unwrap().seed(row.clone());
        connector.node(&NodeId::new("central")).unwrap().set_online(false);

        assert_eq!(registry.get_by_key(&row.id).await.unwrap(), Some(row));
        assert_eq!(registry.get_by_key(&TitleId::new("tt404")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_by_key_all_unreachable_is_error() {
        let (registry, connector) = registry();
        for node in layout() {
            connector.node(&node.id).unwrap().set_online(false);
        }
        assert!(registry
            .get_by_key(&TitleId::from_number(1))
            .await
            .unwrap_err()
            .is_unavailable());
    }

    #[tokio::test]
    async fn test_list_pinned_fragment_when_central_down() {
        let (registry, connector) = registry();
        let movies = connector.node(&NodeId::new("movies")).unwrap();
        let others = connector.node(&NodeId::new("others")).unwrap();
        movies.seed(title(1, TitleType::Movie, 1999));
        others.seed(title(2, TitleType::TvSeries, 2005));
        connector.node(&NodeId::new("central")).unwrap().set_online(false);

        let page = registry
            .list(Pagination::new(1, 10), Some(TitleType::Movie))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, TitleId::from_number(1));
    }

    #[tokio::test]
    async fn test_health_reports_each_node() {
        let (registry, connector) = registry();
        connector.node(&NodeId::new("central")).unwrap().seed(title(1, TitleType::Movie, 2001));
        connector.node(&NodeId::new("others")).unwrap().set_online(false);

        let health = registry.health().await;
        assert_eq!(health.len(), 3);
        assert_eq!(health[&NodeId::new("central")].record_count, Some(1));
        assert!(health[&NodeId::new("movies")].healthy);
        assert!(!health[&NodeId::new("others")].online);
    }

    #[tokio::test]
    async fn test_execute_write_commits() {
        let (registry, connector) = registry();
        let central = NodeId::new("central");
        let mutation = Mutation::insert(TitleId::from_number(3), NewTitle::new(TitleType::Short, "Pip"));
        assert_eq!(
            registry
                .execute_write(&central, &mutation, IsolationLevel::ReadCommitted)
                .await
                .unwrap(),
            1
        );
        assert_eq!(connector.node(&central).unwrap().titles().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_read_applies_query() {
        use crate::model::{SortKey, TitleFilter, TitleQuery};

        let (registry, connector) = registry();
        let others = connector.node(&NodeId::new("others")).unwrap();
        others.seed(title(1, TitleType::TvSeries, 1990));
        others.seed(title(2, TitleType::Short, 2010));
        others.seed(title(3, TitleType::TvSeries, 2020));

        let query = TitleQuery::all(TitleFilter::by_type(Some(TitleType::TvSeries)), SortKey::StartYear);
        let rows = registry.execute_read(&NodeId::new("others"), &query).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec![TitleId::from_number(3), TitleId::from_number(1)]);
    }

    #[tokio::test]
    async fn test_wait_for_all_gives_up() {
        let connector = MemoryConnector::for_nodes(&layout());
        connector.node(&NodeId::new("movies")).unwrap().set_online(false);
        let settings = ConnectionSettings {
            startup_attempts: 2,
            startup_delay_ms: 1,
            ..Default::default()
        };
        let registry = NodeRegistry::new(
            layout(),
            Arc::new(connector),
            settings,
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        assert!(registry.wait_for_all().await.is_err());
    }
}

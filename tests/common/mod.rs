//! Shared fixtures: a three-node cluster on the in-memory engine.
//!
//! - `central`: full replica
//! - `movies`: owns `movie`
//! - `others`: owns every other title type

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fragdb::config::{Config, LoggingConfig};
use fragdb::harness::HarnessSettings;
use fragdb::model::{NewTitle, Title, TitleId, TitleType};
use fragdb::node::{
    ConnectionSettings, IsolationLevel, MemoryConnector, MemoryNode, NodeConfig, NodeId,
};
use fragdb::replication::ReplicationConfig;
use fragdb::Cluster;

pub const CENTRAL: &str = "central";
pub const MOVIES: &str = "movies";
pub const OTHERS: &str = "others";

pub fn nodes() -> Vec<NodeConfig> {
    vec![
        NodeConfig::central(CENTRAL),
        NodeConfig::fragment(MOVIES, vec![TitleType::Movie]),
        NodeConfig::catch_all_fragment(OTHERS),
    ]
}

pub fn config() -> Config {
    Config {
        nodes: nodes(),
        connection: ConnectionSettings {
            attempts: 1,
            retry_delay_ms: 1,
            connect_timeout_ms: 100,
            startup_attempts: 1,
            startup_delay_ms: 1,
        },
        default_isolation: IsolationLevel::ReadCommitted,
        list_order: Default::default(),
        replication: ReplicationConfig {
            max_retries: 3,
            auto_recovery: false,
            recovery_interval_ms: 20,
        },
        harness: HarnessSettings {
            readers: 3,
            read_gap_ms: 20,
            writer_dwell_ms: 150,
            reader_stagger_ms: 20,
            drain_delay_ms: 10,
            processing_delay_ms: 50,
            lock_wait_threshold_ms: 25,
        },
        logging: LoggingConfig::default(),
    }
}

pub struct TestCluster {
    pub cluster: Arc<Cluster>,
    pub connector: MemoryConnector,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: Config) -> Self {
        let connector = MemoryConnector::for_nodes(&config.nodes);
        Self::build(config, connector)
    }

    pub fn build(config: Config, connector: MemoryConnector) -> Self {
        let cluster = Cluster::new(config, Arc::new(connector.clone())).expect("valid layout");
        Self {
            cluster: Arc::new(cluster),
            connector,
        }
    }

    /// A second cluster over the same nodes, as after a process restart.
    pub fn restarted(&self) -> Self {
        Self::build(self.cluster.config().clone(), self.connector.clone())
    }

    pub fn node(&self, id: &str) -> Arc<MemoryNode> {
        self.connector
            .node(&NodeId::new(id))
            .expect("node exists in fixture")
    }

    pub fn set_online(&self, id: &str, online: bool) {
        self.node(id).set_online(online);
    }

    /// Stores the same committed row on Central and the owning fragment.
    pub fn seed(&self, number: u64, fields: NewTitle) -> Title {
        let owner = if fields.title_type == TitleType::Movie {
            MOVIES
        } else {
            OTHERS
        };
        let title = fields.into_title(TitleId::from_number(number), Utc::now());
        self.node(CENTRAL).seed(title.clone());
        self.node(owner).seed(title.clone());
        title
    }
}

pub fn movie(name: &str) -> NewTitle {
    NewTitle::new(TitleType::Movie, name)
        .with_start_year(1999)
        .with_runtime(120)
        .with_genres(["Drama"])
}

pub fn series(name: &str) -> NewTitle {
    NewTitle::new(TitleType::TvSeries, name).with_start_year(2008)
}

pub fn node_id(id: &str) -> NodeId {
    NodeId::new(id)
}

/// Polls until `check` holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

//! Cluster configuration file
//!
//! A single JSON document. Only `nodes` is required; every other section
//! and field has a default. Timings are milliseconds.
//!
//! ```json
//! {
//!   "nodes": [
//!     { "id": "central", "role": "central", "port": 3306 },
//!     { "id": "movies", "role": "fragment", "port": 3307, "title_types": ["movie"] },
//!     { "id": "others", "role": "fragment", "port": 3308, "catch_all": true }
//!   ],
//!   "default_isolation": "READ COMMITTED",
//!   "replication": { "max_retries": 5 },
//!   "logging": { "format": "pretty" }
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::harness::HarnessSettings;
use crate::model::SortKey;
use crate::node::{ConnectionSettings, IsolationLevel, NodeConfig};
use crate::observability::LogFormat;
use crate::replication::{PartitionMap, ReplicationConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Directive used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_filter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Isolation for sessions that do not ask for one.
    #[serde(default)]
    pub default_isolation: IsolationLevel,

    /// Ordering of `list` and `search` results.
    #[serde(default)]
    pub list_order: SortKey,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub harness: HarnessSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Reads, applies password overrides from the environment, and
    /// validates.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.apply_password_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Replaces a node's password with `FRAGDB_<NODE>_PASSWORD` when set.
    pub fn apply_password_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for node in &mut self.nodes {
            if let Some(password) = lookup(&node.password_env_var()) {
                node.password = password;
            }
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        PartitionMap::from_nodes(&self.nodes).map_err(|e| ConfigError::Invalid(e.message))?;

        for node in &self.nodes {
            if node.port == 0 {
                return Err(ConfigError::Invalid(format!("node {} has port 0", node.id)));
            }
        }
        if self.connection.attempts == 0 {
            return Err(ConfigError::Invalid(
                "connection.attempts must be at least 1".into(),
            ));
        }
        if self.connection.startup_attempts == 0 {
            return Err(ConfigError::Invalid(
                "connection.startup_attempts must be at least 1".into(),
            ));
        }
        self.replication
            .validate()
            .map_err(|e| ConfigError::Invalid(e.message))?;
        self.harness
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "nodes": [
            { "id": "central", "role": "central" },
            { "id": "movies", "role": "fragment", "port": 3307, "title_types": ["movie"] },
            { "id": "others", "role": "fragment", "port": 3308, "catch_all": true }
        ]
    }"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_minimal_uses_defaults() {
        let file = write_config(MINIMAL);
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.default_isolation, IsolationLevel::ReadCommitted);
        assert_eq!(config.replication.max_retries, 5);
        assert_eq!(config.connection.attempts, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.filter, "info");
        assert_eq!(config.nodes[0].port, 3306);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/fragdb.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_json() {
        let file = write_config("{ nodes: ");
        assert!(matches!(
            Config::load(file.path()).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_layout_without_catch_all_rejected() {
        let file = write_config(
            r#"{ "nodes": [
                { "id": "central", "role": "central" },
                { "id": "movies", "role": "fragment", "title_types": ["movie"] }
            ] }"#,
        );
        assert!(matches!(
            Config::load(file.path()).unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config: Config = serde_json::from_str(MINIMAL).unwrap();
        config.connection.attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_password_override() {
        let mut config: Config = serde_json::from_str(MINIMAL).unwrap();
        config.apply_password_overrides(|name| {
            (name == "FRAGDB_MOVIES_PASSWORD").then(|| "s3cret".to_string())
        });
        assert_eq!(config.nodes[1].password, "s3cret");
        assert_eq!(config.nodes[0].password, "");
    }
}

//! Node descriptors
//!
//! Node identity and role are configured externally and never inferred.
//! Exactly one node is Central (full replica); every other node is a
//! Fragment owning a disjoint set of title types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::TitleType;

/// Configured node identifier, e.g. `central` or `movies`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Holds every title
    Central,

    /// Holds the titles whose type it owns
    Fragment,
}

/// Connection descriptor and placement for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub role: NodeRole,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_user")]
    pub user: String,

    /// May be overridden with `FRAGDB_<ID>_PASSWORD`.
    #[serde(default)]
    pub password: String,

    /// Title types owned by a fragment. Ignored for Central.
    #[serde(default)]
    pub title_types: Vec<TitleType>,

    /// Marks the fragment that owns every type not listed elsewhere.
    #[serde(default)]
    pub catch_all: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_database() -> String {
    "imdb_distributed".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

impl NodeConfig {
    pub fn central(id: impl Into<String>) -> Self {
        Self::with_role(id, NodeRole::Central)
    }

    pub fn fragment(id: impl Into<String>, title_types: Vec<TitleType>) -> Self {
        Self {
            title_types,
            ..Self::with_role(id, NodeRole::Fragment)
        }
    }

    pub fn catch_all_fragment(id: impl Into<String>) -> Self {
        Self {
            catch_all: true,
            ..Self::with_role(id, NodeRole::Fragment)
        }
    }

    fn with_role(id: impl Into<String>, role: NodeRole) -> Self {
        Self {
            id: NodeId::new(id),
            role,
            host: default_host(),
            port: default_port(),
            database: default_database(),
            user: default_user(),
            password: String::new(),
            title_types: Vec::new(),
            catch_all: false,
        }
    }

    pub fn is_central(&self) -> bool {
        self.role == NodeRole::Central
    }

    /// Connection address without credentials, for logs.
    pub fn address(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }

    /// Environment variable consulted for this node's password.
    pub fn password_env_var(&self) -> String {
        let id: String = self
            .id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("FRAGDB_{}_PASSWORD", id)
    }
}

/// Connection retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Attempts per connect on request paths (at least one).
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Fixed delay between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upper bound for a single connect attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Attempts for the blocking wait-for-all-nodes probe at startup.
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,

    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_startup_attempts() -> u32 {
    30
}

fn default_startup_delay_ms() -> u64 {
    2_000
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            startup_attempts: default_startup_attempts(),
            startup_delay_ms: default_startup_delay_ms(),
        }
    }
}

impl ConnectionSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_defaults_from_json() {
        let node: NodeConfig =
            serde_json::from_str(r#"{"id": "movies", "role": "fragment", "title_types": ["movie"]}"#)
                .unwrap();
        assert_eq!(node.id, NodeId::new("movies"));
        assert_eq!(node.role, NodeRole::Fragment);
        assert_eq!(node.port, 3306);
        assert_eq!(node.title_types, vec![TitleType::Movie]);
        assert!(!node.catch_all);
    }

    #[test]
    fn test_password_env_var_name() {
        let node = NodeConfig::fragment("non-movies", vec![]);
        assert_eq!(node.password_env_var(), "FRAGDB_NON_MOVIES_PASSWORD");
    }

    #[test]
    fn test_address_hides_password() {
        let mut node = NodeConfig::central("central");
        node.password = "secret".into();
        assert!(!node.address().contains("secret"));
    }

    #[test]
    fn test_connection_settings_default() {
        let settings: ConnectionSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, ConnectionSettings::default());
        assert_eq!(settings.retry_delay(), Duration::from_millis(500));
    }
}

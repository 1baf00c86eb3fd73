//! Replication and recovery settings
//!
//! Loaded from the `replication` section of the config file. Timings are
//! milliseconds on disk and `Duration` in code.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{ReplicationError, ReplicationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Replay failures tolerated before a pending entry becomes FAILED.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Run the background recovery loop.
    #[serde(default)]
    pub auto_recovery: bool,

    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_recovery_interval_ms() -> u64 {
    10_000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            auto_recovery: false,
            recovery_interval_ms: default_recovery_interval_ms(),
        }
    }
}

impl ReplicationConfig {
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn validate(&self) -> ReplicationResult<()> {
        if self.max_retries == 0 {
            return Err(ReplicationError::configuration_error(
                "replication.max_retries must be at least 1",
            ));
        }
        if self.auto_recovery && self.recovery_interval_ms == 0 {
            return Err(ReplicationError::configuration_error(
                "replication.recovery_interval_ms must be positive when auto_recovery is on",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: ReplicationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ReplicationConfig::default());
        assert_eq!(config.max_retries, 5);
        assert!(!config.auto_recovery);
        assert_eq!(config.recovery_interval(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let config = ReplicationConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected_only_when_enabled() {
        let mut config = ReplicationConfig {
            recovery_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        config.auto_recovery = true;
        assert!(config.validate().is_err());
    }
}

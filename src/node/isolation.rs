use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Session transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[serde(rename = "READ UNCOMMITTED", alias = "READ-UNCOMMITTED", alias = "read_uncommitted")]
    ReadUncommitted,

    #[default]
    #[serde(rename = "READ COMMITTED", alias = "READ-COMMITTED", alias = "read_committed")]
    ReadCommitted,

    #[serde(rename = "REPEATABLE READ", alias = "REPEATABLE-READ", alias = "repeatable_read")]
    RepeatableRead,

    #[serde(rename = "SERIALIZABLE", alias = "serializable")]
    Serializable,
}

impl IsolationLevel {
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// Level name as used in `SET SESSION TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Plain reads inside a transaction see a stable snapshot.
    pub fn has_stable_reads(&self) -> bool {
        *self >= IsolationLevel::RepeatableRead
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    /// Accepts `READ COMMITTED`, `read-committed` and `read_committed`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', '_'], " ");
        IsolationLevel::ALL
            .iter()
            .find(|level| level.as_sql() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown isolation level: {}", s))
    }
}

//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit code.

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::harness::HarnessError;
use crate::node::NodeError;
use crate::replication::{ReplicationError, ReplicationErrorKind};

/// CLI error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (stdin/stdout)
    IoError,
    /// Malformed request body or argument
    InvalidInput,
    /// Key does not exist on any reachable node
    NotFound,
    /// Node unreachable or query failed
    NodeError,
    /// Write could not be completed
    ReplicationError,
    /// Experiment could not start
    ExperimentError,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "FRAGDB_CLI_CONFIG_ERROR",
            Self::IoError => "FRAGDB_CLI_IO_ERROR",
            Self::InvalidInput => "FRAGDB_CLI_INVALID_INPUT",
            Self::NotFound => "FRAGDB_CLI_NOT_FOUND",
            Self::NodeError => "FRAGDB_CLI_NODE_ERROR",
            Self::ReplicationError => "FRAGDB_CLI_REPLICATION_ERROR",
            Self::ExperimentError => "FRAGDB_CLI_EXPERIMENT_ERROR",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidInput, msg)
    }

    pub fn code(&self) -> CliErrorCode {
        self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_input(format!("JSON error: {}", e))
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::config_error(e.to_string())
    }
}

impl From<NodeError> for CliError {
    fn from(e: NodeError) -> Self {
        Self::new(CliErrorCode::NodeError, e.to_string())
    }
}

impl From<ReplicationError> for CliError {
    fn from(e: ReplicationError) -> Self {
        let code = match e.kind {
            ReplicationErrorKind::InvalidInput => CliErrorCode::InvalidInput,
            ReplicationErrorKind::ConfigurationError => CliErrorCode::ConfigError,
            ReplicationErrorKind::NotFound => CliErrorCode::NotFound,
            _ => CliErrorCode::ReplicationError,
        };
        Self::new(code, e.message)
    }
}

impl From<HarnessError> for CliError {
    fn from(e: HarnessError) -> Self {
        let code = match e {
            HarnessError::NotFound(_) => CliErrorCode::NotFound,
            HarnessError::InvalidInput(_) => CliErrorCode::InvalidInput,
            _ => CliErrorCode::ExperimentError,
        };
        Self::new(code, e.to_string())
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_error_codes() {
        let err: CliError = ReplicationError::not_found("title tt0000009 not found").into();
        assert_eq!(err.code(), CliErrorCode::NotFound);
        assert_eq!(err.code_str(), "FRAGDB_CLI_NOT_FOUND");

        let err: CliError = ReplicationError::id_generation("no lock").into();
        assert_eq!(err.code(), CliErrorCode::ReplicationError);
    }

    #[test]
    fn test_display_includes_code() {
        let err = CliError::invalid_input("empty body");
        assert_eq!(err.to_string(), "FRAGDB_CLI_INVALID_INPUT: empty body");
    }
}

use thiserror::Error;

use crate::model::TitleId;
use crate::node::NodeError;
use crate::replication::ReplicationError;

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that stop an experiment before its participants start.
/// Participant failures are reported, not raised.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("title {0} not found on any reachable node")]
    NotFound(TitleId),

    #[error("invalid experiment input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

impl HarnessError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        HarnessError::InvalidInput(message.into())
    }
}

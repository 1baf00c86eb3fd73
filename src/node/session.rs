//! Storage seams
//!
//! `Connector` opens sessions; `NodeSession` is one connection to one node
//! at a fixed isolation level. Replication, recovery and the concurrency
//! harness only ever talk to nodes through these two traits, so the MySQL
//! backend and the in-process engine are interchangeable.

use async_trait::async_trait;

use super::config::{NodeConfig, NodeId};
use super::errors::NodeResult;
use super::isolation::IsolationLevel;
use super::mutation::Mutation;
use crate::model::{Title, TitleFilter, TitleId, TitleQuery};
use crate::txlog::{TransactionId, TransactionLogEntry, TxStatus};

/// Locking behavior of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Plain,
    /// `SELECT ... FOR UPDATE`: takes and holds row locks until commit.
    ForUpdate,
}

/// Selection over a node's transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogQuery {
    /// `PENDING` entries, oldest first
    Pending,
    /// `FAILED` entries, oldest first
    Failed,
    /// Most recent entries of any status, newest first
    Recent(u32),
}

/// One connection to one node.
///
/// Outside `begin`/`commit` every statement autocommits.
#[async_trait]
pub trait NodeSession: Send {
    fn node_id(&self) -> &NodeId;

    fn isolation(&self) -> IsolationLevel;

    async fn ping(&mut self) -> NodeResult<()>;

    async fn begin(&mut self) -> NodeResult<()>;

    async fn commit(&mut self) -> NodeResult<()>;

    async fn rollback(&mut self) -> NodeResult<()>;

    /// Applies a mutation; returns affected rows.
    async fn apply(&mut self, mutation: &Mutation) -> NodeResult<u64>;

    async fn fetch_title(&mut self, id: &TitleId, mode: ReadMode) -> NodeResult<Option<Title>>;

    /// Highest numeric key in `titles`, `None` on an empty table.
    async fn max_title_number(&mut self, mode: ReadMode) -> NodeResult<Option<u64>>;

    async fn query_titles(&mut self, query: &TitleQuery) -> NodeResult<Vec<Title>>;

    async fn count_titles(&mut self, filter: &TitleFilter) -> NodeResult<u64>;

    async fn append_log(&mut self, entry: &TransactionLogEntry) -> NodeResult<()>;

    /// Moves a `PENDING` entry to `status`. Returns false when no pending
    /// entry with that id exists on this node.
    async fn set_log_status(
        &mut self,
        id: &TransactionId,
        status: TxStatus,
        error: Option<&str>,
    ) -> NodeResult<bool>;

    async fn bump_log_retry(&mut self, id: &TransactionId) -> NodeResult<bool>;

    async fn select_logs(&mut self, query: LogQuery) -> NodeResult<Vec<TransactionLogEntry>>;

    /// Creates the `titles` and `transaction_log` tables when missing.
    async fn ensure_schema(&mut self) -> NodeResult<()>;
}

/// Opens sessions to configured nodes.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a session with the given isolation level already in effect.
    async fn open(
        &self,
        node: &NodeConfig,
        isolation: IsolationLevel,
    ) -> NodeResult<Box<dyn NodeSession>>;
}
